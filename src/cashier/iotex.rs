//! IoTeX cashier: reads `Receipt` logs through the IoTeX API service.

use async_trait::async_trait;
use ethereum_types::{Address, H256};
use tracing::debug;

use super::{
    clamp_range, decode_receipt, receipt_topic, sort_events, MalformedEvent, PulledEvent,
    PulledRange, RawReceipt, TokenCashier,
};
use crate::address::parse_io_address;
use crate::error::WitnessResult;
use crate::iotex_client::{IotexClient, IotexLog};
use crate::transfer::ChainKind;

/// Cashier contract on IoTeX.
pub struct IotexCashier {
    client: IotexClient,
    cashier: Address,
    confirmation_depth: u64,
}

impl IotexCashier {
    pub fn new(client: IotexClient, cashier: Address, confirmation_depth: u64) -> Self {
        Self {
            client,
            cashier,
            confirmation_depth,
        }
    }

    fn decode_log(log: &IotexLog) -> PulledEvent {
        let malformed = |reason: String| {
            PulledEvent::Malformed(MalformedEvent {
                block_height: log.block_height,
                log_index: log.index,
                reason,
            })
        };

        let emitter = match parse_io_address(&log.contract_address) {
            Ok(address) => address,
            Err(e) => return malformed(e.to_string()),
        };
        if log.action_hash.len() != 32 {
            return malformed(format!(
                "action hash is {} bytes, expected 32",
                log.action_hash.len()
            ));
        }

        decode_receipt(RawReceipt {
            chain: ChainKind::Iotex,
            cashier: emitter,
            topics: &log.topics,
            data: &log.data,
            block_height: log.block_height,
            tx_hash: H256::from_slice(&log.action_hash),
            log_index: log.index,
        })
    }
}

#[async_trait]
impl TokenCashier for IotexCashier {
    fn chain(&self) -> ChainKind {
        ChainKind::Iotex
    }

    fn cashier_address(&self) -> Address {
        self.cashier
    }

    async fn finalized_head(&self) -> WitnessResult<u64> {
        let head = self.client.get_chain_height().await?;
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

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            let height = match &log {
                Ok(log) => log.block_height,
                Err(bad) => bad.block_height,
            };
            if height < from || height > to {
                continue;
            }
            let event = match log {
                Ok(log) => Self::decode_log(&log),
                Err(bad) => PulledEvent::Malformed(MalformedEvent {
                    block_height: bad.block_height,
                    log_index: bad.index,
                    reason: bad.reason,
                }),
            };
            events.push(event);
        }
        sort_events(&mut events);
        Ok(PulledRange { to, events })
    }

    async fn close(&self) {
        self.client.close();
    }
}
