//! IoTeX Client Module
//!
//! Client for the IoTeX API service (`iotexapi.APIService`). The node's gateway
//! accepts the service methods as JSON POSTs to `{base}/iotexapi.APIService/{Method}`
//! using the protobuf JSON mapping: 64-bit integers travel as decimal strings and
//! byte fields as standard base64.

use base64::{engine::general_purpose, Engine as _};
use ethereum_types::{Address, H256};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

use crate::address::to_io_address;
use crate::error::{WitnessError, WitnessResult};

const SERVICE_PATH: &str = "iotexapi.APIService";

// ============================================================================
// API RESPONSE STRUCTURES
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetChainMetaResponse {
    chain_meta: ChainMeta,
}

#[derive(Debug, Deserialize)]
struct ChainMeta {
    #[serde(deserialize_with = "deserialize_u64_string")]
    height: u64,
}

#[derive(Debug, Deserialize)]
struct GetLogsResponse {
    #[serde(default)]
    logs: Vec<IotexLogJson>,
}

/// Log as returned on the wire.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IotexLogJson {
    contract_address: String,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    data: String,
    #[serde(deserialize_with = "deserialize_u64_string")]
    blk_height: u64,
    act_hash: String,
    #[serde(default)]
    index: u64,
}

/// IoTeX event log with byte fields decoded.
#[derive(Debug, Clone)]
pub struct IotexLog {
    /// Emitting contract in `io1...` form
    pub contract_address: String,
    /// Indexed event parameters, 32 bytes each
    pub topics: Vec<Vec<u8>>,
    /// Non-indexed event parameters
    pub data: Vec<u8>,
    /// Block height
    pub block_height: u64,
    /// Hash of the action that emitted the log
    pub action_hash: Vec<u8>,
    /// Position of the log within its block
    pub index: u64,
}

/// A log whose byte fields could not be decoded.
#[derive(Debug, Clone)]
pub struct UndecodableLog {
    pub block_height: u64,
    pub index: u64,
    pub reason: String,
}

/// Protobuf JSON encodes uint64 as a string; plain numbers are accepted too.
fn deserialize_u64_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(u64),
    }

    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s.parse().map_err(serde::de::Error::custom),
        StringOrNumber::Number(n) => Ok(n),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GetLogsRequest {
    filter: LogsFilter,
    by_range: GetLogsByRange,
}

#[derive(Debug, Serialize)]
struct LogsFilter {
    address: Vec<String>,
    topics: Vec<Topics>,
}

#[derive(Debug, Serialize)]
struct Topics {
    topic: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GetLogsByRange {
    from_block: String,
    to_block: String,
}

// ============================================================================
// IOTEX CLIENT IMPLEMENTATION
// ============================================================================

/// Client for the IoTeX API service
pub struct IotexClient {
    /// HTTP client; taken out on `close()`
    client: Mutex<Option<Client>>,
    /// Base URL of the API gateway (e.g., "https://api.iotex.one")
    base_url: String,
}

impl IotexClient {
    /// Creates a new IoTeX client for the given gateway URL
    pub fn new(node_url: &str, timeout: Duration) -> WitnessResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WitnessError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client: Mutex::new(Some(client)),
            base_url: node_url.trim_end_matches('/').to_string(),
        })
    }

    /// Current tip height (`GetChainMeta`). IoTeX blocks are final once produced.
    pub async fn get_chain_height(&self) -> WitnessResult<u64> {
        let response: GetChainMetaResponse = self
            .call("GetChainMeta", &serde_json::json!({}))
            .await?;
        Ok(response.chain_meta.height)
    }

    /// Queries logs emitted by `address` with the given first topic in `[from_block, to_block]`.
    ///
    /// # Returns
    ///
    /// * `Ok(Vec<_>)` - One entry per log; `UndecodableLog` where a byte field was not valid base64
    /// * `Err(WitnessError::ChainUnavailable)` - Transport or gateway failure
    pub async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        address: &Address,
        topic0: &H256,
    ) -> WitnessResult<Vec<Result<IotexLog, UndecodableLog>>> {
        let request = GetLogsRequest {
            filter: LogsFilter {
                address: vec![to_io_address(address)?],
                topics: vec![Topics {
                    topic: vec![general_purpose::STANDARD.encode(topic0.as_bytes())],
                }],
            },
            by_range: GetLogsByRange {
                from_block: from_block.to_string(),
                to_block: to_block.to_string(),
            },
        };

        let response: GetLogsResponse = self.call("GetLogs", &request).await?;
        Ok(response.logs.into_iter().map(decode_log).collect())
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

    async fn call<B: Serialize, T: DeserializeOwned>(&self, method: &str, body: &B) -> WitnessResult<T> {
        let url = format!("{}/{}/{}", self.base_url, SERVICE_PATH, method);
        let response = self
            .http()?
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| WitnessError::ChainUnavailable(format!("Failed to send {} request to {}: {}", method, url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(WitnessError::ChainUnavailable(format!(
                "{} returned {} from {}: {}",
                method, status, url, text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| WitnessError::ChainUnavailable(format!("Failed to parse {} response from {}: {}", method, url, e)))
    }
}

fn decode_log(log: IotexLogJson) -> Result<IotexLog, UndecodableLog> {
    let decode = |field: &str, value: &str| {
        general_purpose::STANDARD
            .decode(value)
            .map_err(|e| UndecodableLog {
                block_height: log.blk_height,
                index: log.index,
                reason: format!("bad {} encoding: {}", field, e),
            })
    };

    let topics = log
        .topics
        .iter()
        .map(|topic| decode("topic", topic))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(IotexLog {
        topics,
        data: decode("data", &log.data)?,
        action_hash: decode("actHash", &log.act_hash)?,
        contract_address: log.contract_address,
        block_height: log.blk_height,
        index: log.index,
    })
}
