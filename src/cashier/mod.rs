//! Token Cashier Module
//!
//! A token cashier is the source-chain side of the bridge: a contract that locks
//! deposits and emits a `Receipt` event for each one. This module defines the
//! chain-independent view of a cashier the service loop works against, and the
//! shared decoding of the `Receipt` event ABI.
//!
//! Both chains use the same event layout:
//!
//! ```text
//! Receipt(address indexed token, uint256 indexed id, address sender,
//!         address recipient, uint256 amount, uint256 fee)
//! ```
//!
//! - `topics[0]` = event signature hash
//! - `topics[1]` = token (address, left-padded to 32 bytes)
//! - `topics[2]` = id, the cashier's deposit index
//! - `data` = sender, recipient, amount, fee as four 32-byte words

use async_trait::async_trait;
use ethereum_types::{Address, H256, U256};
use sha3::{Digest, Keccak256};

use crate::config::Config;
use crate::error::{WitnessError, WitnessResult};
use crate::evm_client::EvmClient;
use crate::iotex_client::IotexClient;
use crate::transfer::{ChainKind, Transfer};

pub mod evm;
pub mod iotex;

pub use evm::EvmCashier;
pub use iotex::IotexCashier;

/// Canonical signature of the cashier's deposit event.
pub const RECEIPT_EVENT_SIGNATURE: &str = "Receipt(address,uint256,address,address,uint256,uint256)";

/// keccak256 of [`RECEIPT_EVENT_SIGNATURE`], the `topics[0]` of every receipt log.
pub fn receipt_topic() -> H256 {
    H256::from_slice(&Keccak256::digest(RECEIPT_EVENT_SIGNATURE.as_bytes()))
}

// ============================================================================
// PULLED EVENTS
// ============================================================================

/// A cashier log that could not be decoded into a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedEvent {
    pub block_height: u64,
    pub log_index: u64,
    pub reason: String,
}

/// One entry of a pulled range: either a decoded transfer or a log to skip and alert on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PulledEvent {
    Transfer(Transfer),
    Malformed(MalformedEvent),
}

impl PulledEvent {
    /// `(block_height, log_index)` of the underlying log.
    pub fn position(&self) -> (u64, u64) {
        match self {
            PulledEvent::Transfer(transfer) => transfer.position(),
            PulledEvent::Malformed(event) => (event.block_height, event.log_index),
        }
    }
}

/// Result of scanning a block range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledRange {
    /// Highest height actually covered. Below the requested bound when the
    /// backend's finalized head was lower; `from - 1` when nothing was covered.
    pub to: u64,
    /// Receipt events in `[from, to]`, ordered by `(block_height, log_index)`
    pub events: Vec<PulledEvent>,
}

impl PulledRange {
    /// Nothing covered when scanning from `from`.
    pub fn empty(from: u64) -> Self {
        Self {
            to: from.saturating_sub(1),
            events: Vec::new(),
        }
    }
}

/// Sorts pulled events into processing order.
pub fn sort_events(events: &mut [PulledEvent]) {
    events.sort_by_key(PulledEvent::position);
}

// ============================================================================
// CASHIER ABSTRACTION
// ============================================================================

/// Read access to a cashier contract on one chain.
#[async_trait]
pub trait TokenCashier: Send + Sync {
    /// Chain the cashier lives on.
    fn chain(&self) -> ChainKind;

    /// Address of the cashier contract.
    fn cashier_address(&self) -> Address;

    /// Highest block whose events are considered final: the chain head minus
    /// the confirmation depth.
    async fn finalized_head(&self) -> WitnessResult<u64>;

    /// Scans `[from, to]` for receipt events.
    ///
    /// `to` is clamped to [`finalized_head`](Self::finalized_head) as seen by
    /// this call, and the bound actually covered is returned in
    /// [`PulledRange::to`]. Callers must not treat heights above it as scanned.
    /// Undecodable logs come back as [`PulledEvent::Malformed`] instead of
    /// failing the whole range.
    async fn pull_transfers(&self, from: u64, to: u64) -> WitnessResult<PulledRange>;

    /// Releases the backend connection.
    async fn close(&self);
}

/// Builds the cashier for the configured chain.
pub fn from_config(config: &Config) -> WitnessResult<Box<dyn TokenCashier>> {
    let cashier = config.cashier_address()?;
    let depth = config.confirmation_depth();

    let built: Box<dyn TokenCashier> = match config.chain {
        ChainKind::Ethereum => {
            let client = EvmClient::new(&config.client_url, config.request_timeout())?;
            Box::new(EvmCashier::new(client, cashier, depth))
        }
        ChainKind::Iotex => {
            let client = IotexClient::new(&config.client_url, config.request_timeout())?;
            Box::new(IotexCashier::new(client, cashier, depth))
        }
    };
    Ok(built)
}

/// Clamps an inclusive range to the finalized head.
pub(crate) fn clamp_range(from: u64, to: u64, finalized_head: u64) -> Option<(u64, u64)> {
    let to = to.min(finalized_head);
    if from > to {
        None
    } else {
        Some((from, to))
    }
}

// ============================================================================
// RECEIPT DECODING
// ============================================================================

/// Location and raw content of a receipt log, independent of the chain's wire format.
pub(crate) struct RawReceipt<'a> {
    pub chain: ChainKind,
    pub cashier: Address,
    pub topics: &'a [Vec<u8>],
    pub data: &'a [u8],
    pub block_height: u64,
    pub tx_hash: H256,
    pub log_index: u64,
}

/// Decodes a receipt log, turning any decoding failure into a [`PulledEvent::Malformed`].
pub(crate) fn decode_receipt(raw: RawReceipt<'_>) -> PulledEvent {
    match try_decode_receipt(&raw) {
        Ok(transfer) => PulledEvent::Transfer(transfer),
        Err(e) => PulledEvent::Malformed(MalformedEvent {
            block_height: raw.block_height,
            log_index: raw.log_index,
            reason: e.to_string(),
        }),
    }
}

fn try_decode_receipt(raw: &RawReceipt<'_>) -> WitnessResult<Transfer> {
    if raw.topics.len() < 3 {
        return Err(WitnessError::MalformedEvent(format!(
            "expected 3 topics, got {}",
            raw.topics.len()
        )));
    }
    let topics = raw
        .topics
        .iter()
        .map(|topic| word(topic, "topic"))
        .collect::<WitnessResult<Vec<_>>>()?;
    if topics[0] != receipt_topic().as_bytes() {
        return Err(WitnessError::MalformedEvent(
            "topic is not a Receipt event".to_string(),
        ));
    }

    if raw.data.len() < 128 {
        return Err(WitnessError::MalformedEvent(format!(
            "expected 128 data bytes, got {}",
            raw.data.len()
        )));
    }

    let index = U256::from_big_endian(topics[2]);
    if index > U256::from(u64::MAX) {
        return Err(WitnessError::MalformedEvent(format!(
            "deposit index {} out of range",
            index
        )));
    }

    Ok(Transfer {
        chain: raw.chain,
        cashier: raw.cashier,
        token: word_address(topics[1]),
        index: index.as_u64(),
        sender: word_address(&raw.data[0..32]),
        recipient: word_address(&raw.data[32..64]),
        amount: U256::from_big_endian(&raw.data[64..96]),
        block_height: raw.block_height,
        tx_hash: raw.tx_hash,
        log_index: raw.log_index,
    })
}

fn word<'a>(bytes: &'a [u8], what: &str) -> WitnessResult<&'a [u8]> {
    if bytes.len() != 32 {
        return Err(WitnessError::MalformedEvent(format!(
            "{} is {} bytes, expected 32",
            what,
            bytes.len()
        )));
    }
    Ok(bytes)
}

// Address is the low 20 bytes of an ABI word.
fn word_address(word: &[u8]) -> Address {
    Address::from_slice(&word[12..32])
}
