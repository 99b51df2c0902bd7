//! Relayer API Client
//!
//! HTTP client for the relayer that collects witness signatures. The relayer
//! deduplicates by transfer, so submitting the same witness twice is answered
//! with a conflict, which this client reports as success.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::address::to_hex_address;
use crate::error::{WitnessError, WitnessResult};
use crate::transfer::WitnessRecord;

// ============================================================================
// API STRUCTURES
// ============================================================================

/// Request body of `POST /witnesses`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessSubmission {
    /// Source chain name
    pub chain: String,
    /// Cashier contract (hex)
    pub cashier: String,
    /// Deposit index assigned by the cashier
    pub index: u64,
    /// Attestation id the signature covers (hex)
    pub id: String,
    /// Source token (hex)
    pub token: String,
    /// Depositor (hex)
    pub sender: String,
    /// Beneficiary (hex)
    pub recipient: String,
    /// Amount as a decimal string
    pub amount: String,
    /// Source transaction hash (hex)
    pub tx_hash: String,
    /// Address of the witness key (hex)
    pub witness: String,
    /// 65-byte signature `r || s || v` (hex)
    pub signature: String,
}

impl WitnessSubmission {
    /// Builds the submission for a signed record.
    ///
    /// # Returns
    ///
    /// * `Ok(WitnessSubmission)` - The record carries an id and a signature
    /// * `Err(WitnessError::CorruptRecord)` - Either is missing
    pub fn from_record(record: &WitnessRecord, witness: &ethereum_types::Address) -> WitnessResult<Self> {
        let transfer = &record.transfer;
        let id = record.id.ok_or_else(|| {
            WitnessError::CorruptRecord(format!("record {} has no id", transfer.key()))
        })?;
        let signature = record.signature.as_ref().ok_or_else(|| {
            WitnessError::CorruptRecord(format!("record {} has no signature", transfer.key()))
        })?;

        Ok(Self {
            chain: transfer.chain.to_string(),
            cashier: to_hex_address(&transfer.cashier),
            index: transfer.index,
            id: format!("0x{}", hex::encode(id.as_bytes())),
            token: to_hex_address(&transfer.token),
            sender: to_hex_address(&transfer.sender),
            recipient: to_hex_address(&transfer.recipient),
            amount: transfer.amount.to_string(),
            tx_hash: format!("0x{}", hex::encode(transfer.tx_hash.as_bytes())),
            witness: to_hex_address(witness),
            signature: format!("0x{}", hex::encode(signature)),
        })
    }
}

/// Response body of `GET /witnesses/{id}`.
#[derive(Debug, Clone, Deserialize)]
struct WitnessStatusResponse {
    status: String,
}

/// Settlement state of a submitted transfer as reported by the relayer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementStatus {
    /// The relayer reached quorum and settled the transfer
    Settled,
    /// Known to the relayer but not settled yet
    Pending,
    /// The relayer has no record of the id
    Unknown,
}

// ============================================================================
// RELAYER CLIENT
// ============================================================================

/// HTTP client for the relayer service.
pub struct RelayerClient {
    /// Base URL of the relayer (e.g., "http://127.0.0.1:8080")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl RelayerClient {
    /// Create a new relayer client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the relayer (e.g., "http://127.0.0.1:8080")
    /// * `timeout` - Per-request timeout
    pub fn new(base_url: &str, timeout: Duration) -> WitnessResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WitnessError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Submit a witness signature.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Accepted, or the relayer already had it
    /// * `Err(WitnessError::InvalidTransfer)` - The relayer rejected the witness (4xx)
    /// * `Err(WitnessError::RelayerUnavailable)` - Transport failure, 5xx, or a
    ///   408/425/429 throttling answer; retry later
    pub async fn submit(&self, submission: &WitnessSubmission) -> WitnessResult<()> {
        let url = format!("{}/witnesses", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(submission)
            .send()
            .await
            .map_err(|e| WitnessError::RelayerUnavailable(format!("Failed to send POST {}: {}", url, e)))?;

        let status = response.status();
        if status.is_success() {
            info!("Submitted witness for {}:{}", submission.cashier, submission.index);
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::CONFLICT || body.to_lowercase().contains("already submitted") {
            debug!(
                "Relayer already has witness for {}:{}",
                submission.cashier, submission.index
            );
            return Ok(());
        }

        if is_retryable_client_error(status) {
            return Err(WitnessError::RelayerUnavailable(format!(
                "relayer answered {} for witness {}, retrying later",
                status, submission.id
            )));
        }

        if status.is_client_error() {
            return Err(WitnessError::InvalidTransfer(format!(
                "relayer rejected witness {} with {}: {}",
                submission.id, status, body
            )));
        }

        Err(WitnessError::RelayerUnavailable(format!(
            "relayer answered {} for witness {}: {}",
            status, submission.id, body
        )))
    }

    /// Ask the relayer whether a transfer has been settled.
    ///
    /// # Arguments
    ///
    /// * `id` - Attestation id, `0x` hex
    pub async fn check(&self, id: &str) -> WitnessResult<SettlementStatus> {
        let url = format!("{}/witnesses/{}", self.base_url, id);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| WitnessError::RelayerUnavailable(format!("Failed to send GET {}: {}", url, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(SettlementStatus::Unknown);
        }
        if !status.is_success() {
            return Err(WitnessError::RelayerUnavailable(format!(
                "relayer answered {} for GET {}",
                status, url
            )));
        }

        let body: WitnessStatusResponse = response
            .json()
            .await
            .map_err(|e| WitnessError::RelayerUnavailable(format!("Failed to parse GET {} response: {}", url, e)))?;

        Ok(match body.status.as_str() {
            "settled" => SettlementStatus::Settled,
            _ => SettlementStatus::Pending,
        })
    }
}

/// 4xx answers that say "not now" rather than "never".
fn is_retryable_client_error(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 425 | 429)
}
