//! EVM cashier: reads `Receipt` logs through Ethereum JSON-RPC.

use async_trait::async_trait;
use ethereum_types::{Address, H256};
use tracing::{debug, warn};

use super::{
    clamp_range, decode_receipt, receipt_topic, sort_events, MalformedEvent, PulledEvent,
    PulledRange, RawReceipt, TokenCashier,
};
use crate::address::parse_hex_address;
use crate::error::WitnessResult;
use crate::evm_client::{parse_hex_u64, EvmClient, EvmLog};
use crate::transfer::ChainKind;

/// Cashier contract on an EVM chain.
pub struct EvmCashier {
    client: EvmClient,
    cashier: Address,
    confirmation_depth: u64,
}

impl EvmCashier {
    pub fn new(client: EvmClient, cashier: Address, confirmation_depth: u64) -> Self {
        Self {
            client,
            cashier,
            confirmation_depth,
        }
    }

    fn decode_log(&self, log: &EvmLog) -> PulledEvent {
        let position = parse_hex_u64(&log.block_number).zip(parse_hex_u64(&log.log_index));
        let (block_height, log_index) = position.unwrap_or_default();
        let malformed = |reason: String| {
            PulledEvent::Malformed(MalformedEvent {
                block_height,
                log_index,
                reason,
            })
        };

        if position.is_none() {
            return malformed(format!(
                "bad position fields blockNumber={} logIndex={}",
                log.block_number, log.log_index
            ));
        }

        let emitter = match parse_hex_address(&log.address) {
            Ok(address) => address,
            Err(e) => return malformed(e.to_string()),
        };

        let topics = match log
            .topics
            .iter()
            .map(|topic| decode_hex(topic))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(topics) => topics,
            Err(e) => return malformed(format!("bad topic hex: {}", e)),
        };
        let data = match decode_hex(&log.data) {
            Ok(data) => data,
            Err(e) => return malformed(format!("bad data hex: {}", e)),
        };
        let tx_hash = match decode_hex(&log.transaction_hash) {
            Ok(bytes) if bytes.len() == 32 => H256::from_slice(&bytes),
            _ => return malformed(format!("bad transaction hash {}", log.transaction_hash)),
        };

        decode_receipt(RawReceipt {
            chain: ChainKind::Ethereum,
            cashier: emitter,
            topics: &topics,
            data: &data,
            block_height,
            tx_hash,
            log_index,
        })
    }
}

#[async_trait]
impl TokenCashier for EvmCashier {
    fn chain(&self) -> ChainKind {
        ChainKind::Ethereum
    }

    fn cashier_address(&self) -> Address {
        self.cashier
    }

    async fn finalized_head(&self) -> WitnessResult<u64> {
        let head = self.client.get_block_number().await?;
        Ok(head.saturating_sub(self.confirmation_depth))
    }

    async fn pull_transfers(&self, from: u64, to: u64) -> WitnessResult<PulledRange> {
        let finalized = self.finalized_head().await?;
        let Some((from, to)) = clamp_range(from, to, finalized) else {
            return Ok(PulledRange::empty(from));
        };

        let logs = self
            .client
            .get_logs(from, to, &self.cashier, &receipt_topic())
            .await?;
        debug!("Fetched {} cashier logs in [{}, {}]", logs.len(), from, to);

        let mut events: Vec<PulledEvent> = logs
            .iter()
            .filter(|log| {
                if log.removed {
                    warn!("Ignoring removed log {} in tx {}", log.log_index, log.transaction_hash);
                }
                !log.removed
            })
            // Nodes may answer with logs outside the requested range. A log whose
            // height does not parse is kept so it is reported as malformed.
            .filter(|log| match parse_hex_u64(&log.block_number) {
                Some(height) => height >= from && height <= to,
                None => true,
            })
            .map(|log| self.decode_log(log))
            .collect();
        sort_events(&mut events);
        Ok(PulledRange { to, events })
    }

    async fn close(&self) {
        self.client.close();
    }
}

fn decode_hex(value: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(value.strip_prefix("0x").unwrap_or(value))
}
