//! Witness Service Library
//!
//! This crate watches a token cashier contract on a source chain (Ethereum or
//! IoTeX), validates each deposit against the token pair whitelist, signs an
//! attestation for it and hands the signature to the bridge relayer. Progress
//! is kept in SQLite so a restart never loses or duplicates a witness.

pub mod address;
pub mod alert;
pub mod cashier;
pub mod config;
pub mod crypto;
pub mod error;
pub mod evm_client;
pub mod iotex_client;
pub mod relayer_client;
pub mod service;
pub mod storage;
pub mod transfer;

// Re-export commonly used types
pub use alert::Alerter;
pub use cashier::{
    EvmCashier, IotexCashier, MalformedEvent, PulledEvent, PulledRange, TokenCashier,
};
pub use config::Config;
pub use crypto::{Signer, WitnessSigner};
pub use error::{WitnessError, WitnessResult};
pub use relayer_client::{RelayerClient, SettlementStatus, WitnessSubmission};
pub use service::{
    shutdown_channel, CycleOutcome, ScanPhase, ServiceSettings, ShutdownHandle, ShutdownSignal,
    WitnessService,
};
pub use storage::Recorder;
pub use transfer::{
    ChainKind, CursorKey, TokenPair, Transfer, TransferKey, TransferStatus, WitnessRecord,
};
