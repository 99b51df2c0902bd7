//! Transfer Data Model
//!
//! Types shared by the cashiers, the recorder and the service loop: the
//! transfer observed on the source chain, its processing status, the token
//! pair whitelist entry and the scan cursor key.

use chrono::{DateTime, Utc};
use ethereum_types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

use crate::address::to_hex_address;

// ============================================================================
// CHAIN IDENTIFIER
// ============================================================================

/// Source chains a witness can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    /// Ethereum (or any EVM chain) read via JSON-RPC
    Ethereum,
    /// IoTeX read via its API service
    Iotex,
}

impl ChainKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainKind::Ethereum => "ethereum",
            ChainKind::Iotex => "iotex",
        }
    }

    /// Blocks an event must be buried under before it is treated as final.
    ///
    /// IoTeX blocks are final once produced; Ethereum needs a buffer against reorgs.
    pub fn default_confirmation_depth(&self) -> u64 {
        match self {
            ChainKind::Ethereum => 12,
            ChainKind::Iotex => 0,
        }
    }
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ethereum" => Ok(ChainKind::Ethereum),
            "iotex" => Ok(ChainKind::Iotex),
            other => Err(format!("unknown chain name {}", other)),
        }
    }
}

// ============================================================================
// TRANSFER
// ============================================================================

/// Unique identity of a transfer: the cashier assigns every deposit a
/// sequential index, so `(chain, cashier, index)` never repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub chain: ChainKind,
    pub cashier: Address,
    pub index: u64,
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.chain,
            to_hex_address(&self.cashier),
            self.index
        )
    }
}

/// A deposit observed on the source chain's cashier contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    /// Chain the cashier lives on
    pub chain: ChainKind,
    /// Cashier contract that emitted the event
    pub cashier: Address,
    /// Token deposited on the source chain
    pub token: Address,
    /// Sequence number assigned by the cashier
    pub index: u64,
    /// Depositor
    pub sender: Address,
    /// Beneficiary on the destination chain
    pub recipient: Address,
    /// Amount in the token's smallest unit
    pub amount: U256,
    /// Height of the block containing the event
    pub block_height: u64,
    /// Hash of the transaction that emitted the event
    pub tx_hash: H256,
    /// Position of the log within its block
    pub log_index: u64,
}

impl Transfer {
    pub fn key(&self) -> TransferKey {
        TransferKey {
            chain: self.chain,
            cashier: self.cashier,
            index: self.index,
        }
    }

    /// Canonical attestation id.
    ///
    /// `keccak256(validator || cashier || co_token || index || sender || recipient || amount)`
    /// with addresses as raw 20 bytes and integers as 32-byte big-endian words,
    /// matching the validator contract's packed encoding.
    pub fn id(&self, validator: &Address, co_token: &Address) -> H256 {
        let mut index_word = [0u8; 32];
        U256::from(self.index).to_big_endian(&mut index_word);
        let mut amount_word = [0u8; 32];
        self.amount.to_big_endian(&mut amount_word);

        let mut hasher = Keccak256::new();
        hasher.update(validator.as_bytes());
        hasher.update(self.cashier.as_bytes());
        hasher.update(co_token.as_bytes());
        hasher.update(index_word);
        hasher.update(self.sender.as_bytes());
        hasher.update(self.recipient.as_bytes());
        hasher.update(amount_word);
        H256::from_slice(&hasher.finalize())
    }

    /// Sort key for processing order within a batch.
    pub fn position(&self) -> (u64, u64) {
        (self.block_height, self.log_index)
    }
}

// ============================================================================
// PROCESSING STATUS
// ============================================================================

/// Lifecycle of a witnessed transfer.
///
/// Statuses only move forward; `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Discovered,
    Validated,
    Signed,
    Submitted,
    Confirmed,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Discovered => "discovered",
            TransferStatus::Validated => "validated",
            TransferStatus::Signed => "signed",
            TransferStatus::Submitted => "submitted",
            TransferStatus::Confirmed => "confirmed",
            TransferStatus::Failed => "failed",
        }
    }

    /// True once a signature has been durably stored, or the transfer was rejected.
    /// Such records are never reprocessed by a rescan.
    pub fn is_settled_for_scan(&self) -> bool {
        matches!(
            self,
            TransferStatus::Signed
                | TransferStatus::Submitted
                | TransferStatus::Confirmed
                | TransferStatus::Failed
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(TransferStatus::Discovered),
            "validated" => Ok(TransferStatus::Validated),
            "signed" => Ok(TransferStatus::Signed),
            "submitted" => Ok(TransferStatus::Submitted),
            "confirmed" => Ok(TransferStatus::Confirmed),
            "failed" => Ok(TransferStatus::Failed),
            other => Err(format!("unknown transfer status {}", other)),
        }
    }
}

// ============================================================================
// PERSISTED RECORDS
// ============================================================================

/// Persisted witness state for one transfer.
#[derive(Debug, Clone)]
pub struct WitnessRecord {
    pub transfer: Transfer,
    pub status: TransferStatus,
    /// Attestation id, known once the token pair has been resolved
    pub id: Option<H256>,
    /// Witness signature over `id`
    pub signature: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Whitelisted mapping from a source token to its destination counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPair {
    pub token: Address,
    pub co_token: Address,
}

/// Identifies one scan cursor: a witness scans one cashier on one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorKey {
    pub chain: ChainKind,
    pub cashier: Address,
}
