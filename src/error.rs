//! Error Types
//!
//! Failure taxonomy for the witness pipeline. The service loop decides how to
//! react to a failure (retry next tick, skip, mark failed, abort) purely from
//! the variant, so every component maps its low-level errors onto one of these.

use thiserror::Error;

/// Errors produced by the witness pipeline.
#[derive(Debug, Error)]
pub enum WitnessError {
    /// The chain RPC backend could not be reached or returned an RPC error.
    /// Transient: the work is retried on the next poll tick.
    #[error("chain unavailable: {0}")]
    ChainUnavailable(String),

    /// A cashier log could not be decoded into a transfer.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// The transfer failed policy checks. Permanent for that transfer.
    #[error("invalid transfer: {0}")]
    InvalidTransfer(String),

    /// The relayer could not be reached or answered with a server error.
    /// Transient: submission is retried on the next poll tick.
    #[error("relayer unavailable: {0}")]
    RelayerUnavailable(String),

    /// Bad or missing configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Signing the attestation failed.
    #[error("signing error: {0}")]
    Signing(String),

    /// The persistence layer failed. Fatal for the running service.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A stored row could not be interpreted.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),
}

impl WitnessError {
    /// Whether the failure should simply be retried on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WitnessError::ChainUnavailable(_) | WitnessError::RelayerUnavailable(_)
        )
    }

    /// Whether the failure must stop the service.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WitnessError::Configuration(_)
                | WitnessError::Storage(_)
                | WitnessError::CorruptRecord(_)
        )
    }
}

pub type WitnessResult<T> = std::result::Result<T, WitnessError>;
