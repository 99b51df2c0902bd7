//! EVM Client Module
//!
//! This module provides a client for communicating with EVM-compatible blockchain nodes
//! via their JSON-RPC API. The witness only reads: it asks for the head height and
//! for the logs a cashier emitted in a block range.

use ethereum_types::{Address, H256};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

use crate::address::to_hex_address;
use crate::error::{WitnessError, WitnessResult};

// ============================================================================
// API RESPONSE STRUCTURES
// ============================================================================

/// EVM JSON-RPC request wrapper
#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    method: String,
    params: Vec<serde_json::Value>,
    id: u64,
}

/// EVM JSON-RPC response wrapper
#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// EVM event log entry
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvmLog {
    /// Address of the contract that emitted the event
    pub address: String,
    /// Array of topics (indexed event parameters)
    pub topics: Vec<String>,
    /// Event data (non-indexed parameters)
    pub data: String,
    /// Block number (JSON-RPC uses camelCase: blockNumber)
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    /// Transaction hash (JSON-RPC uses camelCase: transactionHash)
    #[serde(rename = "transactionHash")]
    pub transaction_hash: String,
    /// Log index (JSON-RPC uses camelCase: logIndex)
    #[serde(rename = "logIndex")]
    pub log_index: String,
    /// Set by the node when the log was dropped by a reorg
    #[serde(default)]
    pub removed: bool,
}

// ============================================================================
// EVM CLIENT IMPLEMENTATION
// ============================================================================

/// Client for communicating with EVM-compatible blockchain nodes via JSON-RPC
pub struct EvmClient {
    /// HTTP client; taken out on `close()`
    client: Mutex<Option<Client>>,
    /// Base URL of the EVM node (e.g., "http://127.0.0.1:8545")
    base_url: String,
}

impl EvmClient {
    /// Creates a new EVM client for the given node URL
    ///
    /// # Arguments
    ///
    /// * `node_url` - Base URL of the EVM node (e.g., "http://127.0.0.1:8545")
    /// * `timeout` - Per-request timeout
    ///
    /// # Returns
    ///
    /// * `Ok(EvmClient)` - Successfully created client
    /// * `Err(WitnessError::Configuration)` - Failed to create the HTTP client
    pub fn new(node_url: &str, timeout: Duration) -> WitnessResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WitnessError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client: Mutex::new(Some(client)),
            base_url: node_url.to_string(),
        })
    }

    /// Gets the current block number
    ///
    /// # Returns
    ///
    /// * `Ok(u64)` - Current block number
    /// * `Err(WitnessError::ChainUnavailable)` - Failed to query block number
    pub async fn get_block_number(&self) -> WitnessResult<u64> {
        let block_number_hex: String = self.call("eth_blockNumber", vec![]).await?;
        parse_hex_u64(&block_number_hex).ok_or_else(|| {
            WitnessError::ChainUnavailable(format!(
                "Invalid block number '{}' from {}",
                block_number_hex, self.base_url
            ))
        })
    }

    /// Queries logs emitted by `address` with the given first topic in `[from_block, to_block]`.
    ///
    /// # Arguments
    ///
    /// * `from_block` - First block, inclusive
    /// * `to_block` - Last block, inclusive
    /// * `address` - Emitting contract
    /// * `topic0` - Event signature hash
    ///
    /// # Returns
    ///
    /// * `Ok(Vec<EvmLog>)` - Raw logs in node order
    /// * `Err(WitnessError::ChainUnavailable)` - Failed to query logs
    pub async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        address: &Address,
        topic0: &H256,
    ) -> WitnessResult<Vec<EvmLog>> {
        let filter = serde_json::json!({
            "address": to_hex_address(address),
            "topics": [format!("0x{}", hex::encode(topic0.as_bytes()))],
            "fromBlock": format!("0x{:x}", from_block),
            "toBlock": format!("0x{:x}", to_block),
        });

        self.call("eth_getLogs", vec![filter]).await
    }

    /// Drops the HTTP client. Later calls fail with `ChainUnavailable`.
    pub fn close(&self) {
        if let Ok(mut guard) = self.client.lock() {
            guard.take();
        }
    }

    fn http(&self) -> WitnessResult<Client> {
        self.client
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or_else(|| WitnessError::ChainUnavailable(format!("client for {} is closed", self.base_url)))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> WitnessResult<T> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: 1,
        };

        let response: JsonRpcResponse<T> = self
            .http()?
            .post(&self.base_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                WitnessError::ChainUnavailable(format!(
                    "Failed to send {} request to {}: {}",
                    method, self.base_url, e
                ))
            })?
            .json()
            .await
            .map_err(|e| {
                WitnessError::ChainUnavailable(format!(
                    "Failed to parse {} response from {}: {}",
                    method, self.base_url, e
                ))
            })?;

        if let Some(error) = response.error {
            return Err(WitnessError::ChainUnavailable(format!(
                "JSON-RPC error from {}: {} (code: {})",
                self.base_url, error.message, error.code
            )));
        }

        response.result.ok_or_else(|| {
            WitnessError::ChainUnavailable(format!("No result in {} response", method))
        })
    }
}

/// Parses a `0x`-prefixed hex quantity.
pub fn parse_hex_u64(value: &str) -> Option<u64> {
    u64::from_str_radix(value.strip_prefix("0x").unwrap_or(value), 16).ok()
}
