//! Shared test helpers for integration tests
//!
//! The module is organized into several categories:
//! - **Constants**: Dummy addresses and keys
//! - **Transfer Builders**: Default transfers and their on-chain log encodings
//! - **Test Doubles**: An in-memory cashier and a counting signer
//! - **Setup Helpers**: Recorder, relayer mock server and service wiring

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use ethereum_types::{Address, H256, U256};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use witness_service::address::parse_address;
use witness_service::cashier::{
    receipt_topic, MalformedEvent, PulledEvent, PulledRange, TokenCashier,
};
use witness_service::config::Config;
use witness_service::{
    Alerter, ChainKind, Recorder, RelayerClient, ServiceSettings, ShutdownHandle, Signer,
    TokenPair, Transfer, WitnessError, WitnessResult, WitnessService, WitnessSigner,
};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Default anvil account #0 key; its address is well known
pub const DUMMY_PRIVATE_KEY: &str =
    "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

/// Address of `DUMMY_PRIVATE_KEY`
pub const DUMMY_WITNESS_ADDR: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

/// Dummy cashier contract (EVM format, 20 bytes)
pub const DUMMY_CASHIER_ADDR: &str = "0x00000000000000000000000000000000000000ca";

/// Dummy validator contract (EVM format, 20 bytes)
pub const DUMMY_VALIDATOR_ADDR: &str = "0x00000000000000000000000000000000000000fa";

/// Dummy whitelisted source token
pub const DUMMY_TOKEN_ADDR: &str = "0x0000000000000000000000000000000000000070";

/// Destination counterpart of `DUMMY_TOKEN_ADDR`
pub const DUMMY_CO_TOKEN_ADDR: &str = "0x0000000000000000000000000000000000000071";

/// Token without a registered pair
pub const DUMMY_UNKNOWN_TOKEN_ADDR: &str = "0x0000000000000000000000000000000000000072";

/// Dummy depositor
pub const DUMMY_SENDER_ADDR: &str = "0x0000000000000000000000000000000000000005";

/// Dummy beneficiary
pub const DUMMY_RECIPIENT_ADDR: &str = "0x0000000000000000000000000000000000000006";

/// Default deposit amount
pub const DUMMY_AMOUNT: u64 = 1_000;

pub fn addr(value: &str) -> Address {
    parse_address(value).expect("dummy address must parse")
}

// ============================================================================
// CONFIGURATION BUILDERS
// ============================================================================

/// Build a valid config pointing at the given endpoints.
pub fn build_test_config(client_url: &str, relayer_url: &str) -> Config {
    Config {
        chain: ChainKind::Ethereum,
        client_url: client_url.to_string(),
        private_key: DUMMY_PRIVATE_KEY.to_string(),
        validator_contract_address: DUMMY_VALIDATOR_ADDR.to_string(),
        cashier_contract_address: DUMMY_CASHIER_ADDR.to_string(),
        start_block_height: 101,
        batch_size: 100,
        interval_ms: 10,
        settlement_checks_per_cycle: 50,
        confirmation_depth: None,
        request_timeout_ms: 5_000,
        relayer_url: relayer_url.to_string(),
        alert_webhook_url: None,
        database_url: "sqlite::memory:".to_string(),
        transfer_table_name: "transfers".to_string(),
        token_pair_table_name: "token_pairs".to_string(),
    }
}

// ============================================================================
// TRANSFER BUILDERS
// ============================================================================

/// Create a whitelisted transfer from the dummy cashier.
pub fn create_base_transfer(index: u64, block_height: u64, log_index: u64) -> Transfer {
    Transfer {
        chain: ChainKind::Ethereum,
        cashier: addr(DUMMY_CASHIER_ADDR),
        token: addr(DUMMY_TOKEN_ADDR),
        index,
        sender: addr(DUMMY_SENDER_ADDR),
        recipient: addr(DUMMY_RECIPIENT_ADDR),
        amount: U256::from(DUMMY_AMOUNT),
        block_height,
        tx_hash: H256::from_low_u64_be(0x1000 + index),
        log_index,
    }
}

fn address_word(address: &Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_bytes());
    word
}

fn u256_word(value: U256) -> [u8; 32] {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    word
}

/// Receipt event topics of a transfer.
pub fn receipt_topics(transfer: &Transfer) -> Vec<[u8; 32]> {
    vec![
        receipt_topic().to_fixed_bytes(),
        address_word(&transfer.token),
        u256_word(U256::from(transfer.index)),
    ]
}

/// Receipt event data of a transfer (fee is always zero).
pub fn receipt_data(transfer: &Transfer) -> Vec<u8> {
    let mut data = Vec::with_capacity(128);
    data.extend_from_slice(&address_word(&transfer.sender));
    data.extend_from_slice(&address_word(&transfer.recipient));
    data.extend_from_slice(&u256_word(transfer.amount));
    data.extend_from_slice(&u256_word(U256::zero()));
    data
}

/// `eth_getLogs` entry for a transfer.
pub fn evm_receipt_log(transfer: &Transfer) -> serde_json::Value {
    let topics: Vec<String> = receipt_topics(transfer)
        .iter()
        .map(|topic| format!("0x{}", hex::encode(topic)))
        .collect();
    json!({
        "address": format!("0x{}", hex::encode(transfer.cashier.as_bytes())),
        "topics": topics,
        "data": format!("0x{}", hex::encode(receipt_data(transfer))),
        "blockNumber": format!("0x{:x}", transfer.block_height),
        "transactionHash": format!("0x{}", hex::encode(transfer.tx_hash.as_bytes())),
        "logIndex": format!("0x{:x}", transfer.log_index),
        "removed": false
    })
}

/// IoTeX `GetLogs` entry for a transfer (protobuf JSON mapping).
pub fn iotex_receipt_log(transfer: &Transfer, contract_io_address: &str) -> serde_json::Value {
    let topics: Vec<String> = receipt_topics(transfer)
        .iter()
        .map(|topic| general_purpose::STANDARD.encode(topic))
        .collect();
    json!({
        "contractAddress": contract_io_address,
        "topics": topics,
        "data": general_purpose::STANDARD.encode(receipt_data(transfer)),
        "blkHeight": transfer.block_height.to_string(),
        "actHash": general_purpose::STANDARD.encode(transfer.tx_hash.as_bytes()),
        "index": transfer.log_index
    })
}

// ============================================================================
// TEST DOUBLES
// ============================================================================

#[derive(Default)]
struct MockChainState {
    finalized_head: u64,
    /// Head seen by `pull_transfers` when it lags behind `finalized_head`
    pull_head: Option<u64>,
    events: Vec<PulledEvent>,
    pulls: Vec<(u64, u64)>,
    unavailable: bool,
    closed: bool,
}

/// Shared handle on the state behind a [`MockCashier`].
#[derive(Clone, Default)]
pub struct MockChain {
    state: Arc<Mutex<MockChainState>>,
}

impl MockChain {
    pub fn new(finalized_head: u64) -> Self {
        let chain = Self::default();
        chain.set_head(finalized_head);
        chain
    }

    pub fn set_head(&self, finalized_head: u64) {
        self.state.lock().unwrap().finalized_head = finalized_head;
    }

    /// Makes `pull_transfers` see a different head than `finalized_head`,
    /// like a load-balanced node answering from a lagging replica.
    pub fn set_pull_head(&self, pull_head: Option<u64>) {
        self.state.lock().unwrap().pull_head = pull_head;
    }

    /// Adds a transfer; events are kept in insertion order, not sorted.
    pub fn push_transfer(&self, transfer: Transfer) {
        self.state
            .lock()
            .unwrap()
            .events
            .push(PulledEvent::Transfer(transfer));
    }

    pub fn push_malformed(&self, block_height: u64, log_index: u64) {
        self.state
            .lock()
            .unwrap()
            .events
            .push(PulledEvent::Malformed(MalformedEvent {
                block_height,
                log_index,
                reason: "bad data".to_string(),
            }));
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    /// Ranges requested through `pull_transfers`.
    pub fn pulls(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().pulls.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn cashier(&self) -> MockCashier {
        MockCashier {
            chain: self.clone(),
            cashier: addr(DUMMY_CASHIER_ADDR),
        }
    }
}

/// In-memory cashier. Returns events unsorted so callers' ordering is exercised.
pub struct MockCashier {
    chain: MockChain,
    cashier: Address,
}

#[async_trait]
impl TokenCashier for MockCashier {
    fn chain(&self) -> ChainKind {
        ChainKind::Ethereum
    }

    fn cashier_address(&self) -> Address {
        self.cashier
    }

    async fn finalized_head(&self) -> WitnessResult<u64> {
        let state = self.chain.state.lock().unwrap();
        if state.unavailable {
            return Err(WitnessError::ChainUnavailable("mock chain down".to_string()));
        }
        Ok(state.finalized_head)
    }

    async fn pull_transfers(&self, from: u64, to: u64) -> WitnessResult<PulledRange> {
        let mut state = self.chain.state.lock().unwrap();
        if state.unavailable {
            return Err(WitnessError::ChainUnavailable("mock chain down".to_string()));
        }
        state.pulls.push((from, to));
        let to = to.min(state.pull_head.unwrap_or(state.finalized_head));
        if from > to {
            return Ok(PulledRange::empty(from));
        }
        let events = state
            .events
            .iter()
            .filter(|event| {
                let (height, _) = event.position();
                height >= from && height <= to
            })
            .cloned()
            .collect();
        Ok(PulledRange { to, events })
    }

    async fn close(&self) {
        self.chain.state.lock().unwrap().closed = true;
    }
}

/// Signer that counts signatures and can request a stop after a number of them.
pub struct CountingSigner {
    inner: WitnessSigner,
    count: Arc<AtomicUsize>,
    stop_after: Option<(usize, ShutdownHandle)>,
}

impl CountingSigner {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let signer = Self {
            inner: WitnessSigner::from_hex(DUMMY_PRIVATE_KEY).expect("dummy key must load"),
            count: count.clone(),
            stop_after: None,
        };
        (signer, count)
    }

    pub fn stopping_after(signatures: usize, handle: ShutdownHandle) -> (Self, Arc<AtomicUsize>) {
        let (mut signer, count) = Self::new();
        signer.stop_after = Some((signatures, handle));
        (signer, count)
    }
}

impl Signer for CountingSigner {
    fn address(&self) -> Address {
        self.inner.address()
    }

    fn sign(&self, id: &H256) -> WitnessResult<Vec<u8>> {
        let signed = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, ref handle)) = self.stop_after {
            if signed >= limit {
                handle.stop();
            }
        }
        self.inner.sign(id)
    }
}

// ============================================================================
// SETUP HELPERS
// ============================================================================

/// In-memory recorder with the dummy token pair registered.
pub async fn setup_recorder() -> Recorder {
    let recorder = Recorder::connect("sqlite::memory:", "transfers", "token_pairs")
        .await
        .expect("Failed to open in-memory store");
    recorder.start().await.expect("Failed to create tables");
    recorder
        .add_token_pair(&TokenPair {
            token: addr(DUMMY_TOKEN_ADDR),
            co_token: addr(DUMMY_CO_TOKEN_ADDR),
        })
        .await
        .expect("Failed to add token pair");
    recorder
}

/// Relayer mock accepting every submission and reporting everything pending.
pub async fn setup_relayer() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/witnesses"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "accepted"})))
        .mount(&server)
        .await;
    mount_settlement_status(&server, "pending").await;
    server
}

/// Answers every `GET /witnesses/{id}` with the given status.
pub async fn mount_settlement_status(server: &MockServer, status: &str) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/witnesses/0x[0-9a-f]{64}$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": status })))
        .mount(server)
        .await;
}

/// Witness submissions the relayer mock received, in arrival order.
pub async fn received_submissions(server: &MockServer) -> Vec<witness_service::WitnessSubmission> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == "/witnesses")
        .map(|request| serde_json::from_slice(&request.body).expect("submission must be JSON"))
        .collect()
}

/// Service settings for tests: tiny interval, dummy validator.
pub fn test_settings(start_block_height: u64, batch_size: u64) -> ServiceSettings {
    ServiceSettings {
        validator: addr(DUMMY_VALIDATOR_ADDR),
        start_block_height,
        batch_size,
        interval: Duration::from_millis(10),
        settlement_checks_per_cycle: 50,
    }
}

/// Wire a service around the mock chain.
pub fn build_service(
    settings: ServiceSettings,
    chain: &MockChain,
    recorder: &Recorder,
    signer: CountingSigner,
    relayer: &MockServer,
) -> WitnessService {
    WitnessService::new(
        settings,
        Box::new(chain.cashier()),
        recorder.clone(),
        Box::new(signer),
        RelayerClient::new(&relayer.uri(), Duration::from_secs(5)).expect("Failed to create relayer client"),
        Alerter::log_only(),
    )
}
