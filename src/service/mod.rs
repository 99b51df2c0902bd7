//! Witness Service Module
//!
//! The scan loop. Each cycle:
//!
//! 1. Resubmits records that were signed but never accepted by the relayer,
//!    reusing the stored signature.
//! 2. Asks the relayer about a bounded number of submitted records, least
//!    recently checked first, and marks settled ones `Confirmed`.
//! 3. Pulls the next batch of finalized cashier events after the cursor,
//!    validates, signs, records and submits each transfer in order.
//! 4. Advances the cursor to the highest height the cashier actually covered
//!    once every transfer of the batch is recorded.
//!
//! Crashing anywhere before step 4 only causes the same range to be scanned
//! again; the recorder recognizes known transfers by key and the status stored
//! with each record tells the loop where to resume.

use ethereum_types::{Address, H256};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::alert::Alerter;
use crate::cashier::{sort_events, PulledEvent, TokenCashier};
use crate::config::Config;
use crate::crypto::Signer;
use crate::error::{WitnessError, WitnessResult};
use crate::relayer_client::{RelayerClient, SettlementStatus, WitnessSubmission};
use crate::storage::Recorder;
use crate::transfer::{CursorKey, Transfer, TransferStatus, WitnessRecord};

// ============================================================================
// LIFECYCLE TYPES
// ============================================================================

/// Where the current cycle is. Exposed for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Idle,
    Fetching,
    Validating,
    Signing,
    Recording,
    Submitting,
}

/// Requests a graceful stop of a running service.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: std::sync::Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        // Fails only when every receiver is gone, i.e. nothing is running.
        let _ = self.sender.send(true);
    }
}

/// Observed by the service between batches and between transfers.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_stopped(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once stop has been requested.
    pub async fn stopped(&mut self) {
        while !*self.receiver.borrow_and_update() {
            if self.receiver.changed().await.is_err() {
                // Handle dropped without stopping: never resolve.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Creates a connected stop handle and signal.
pub fn shutdown_channel() -> (ShutdownHandle, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (
        ShutdownHandle {
            sender: std::sync::Arc::new(sender),
        },
        ShutdownSignal { receiver },
    )
}

/// What a single cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing new was finalized after the cursor
    CaughtUp { cursor: u64 },
    /// `(from, to]` was processed and the cursor now sits at `to`
    Scanned { from: u64, to: u64, transfers: usize },
    /// Stop was requested mid-batch; the cursor was left at `cursor`
    Interrupted { cursor: u64 },
}

// ============================================================================
// SETTINGS
// ============================================================================

/// Scan parameters of a service instance.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Validator contract the attestation id is bound to
    pub validator: Address,
    /// First height scanned when no cursor exists
    pub start_block_height: u64,
    /// Maximum blocks per cycle
    pub batch_size: u64,
    /// Pause between cycles
    pub interval: Duration,
    /// Maximum relayer settlement lookups per cycle
    pub settlement_checks_per_cycle: u32,
}

impl ServiceSettings {
    pub fn from_config(config: &Config) -> WitnessResult<Self> {
        Ok(Self {
            validator: config.validator_address()?,
            start_block_height: config.start_block_height,
            batch_size: config.batch_size,
            interval: config.interval(),
            settlement_checks_per_cycle: config.settlement_checks_per_cycle,
        })
    }
}

// ============================================================================
// SERVICE IMPLEMENTATION
// ============================================================================

/// Watches one cashier and witnesses its transfers.
pub struct WitnessService {
    settings: ServiceSettings,
    cashier: Box<dyn TokenCashier>,
    recorder: Recorder,
    signer: Box<dyn Signer>,
    relayer: RelayerClient,
    alerter: Alerter,
    phase: Mutex<ScanPhase>,
}

impl WitnessService {
    pub fn new(
        settings: ServiceSettings,
        cashier: Box<dyn TokenCashier>,
        recorder: Recorder,
        signer: Box<dyn Signer>,
        relayer: RelayerClient,
        alerter: Alerter,
    ) -> Self {
        Self {
            settings,
            cashier,
            recorder,
            signer,
            relayer,
            alerter,
            phase: Mutex::new(ScanPhase::Idle),
        }
    }

    /// Current phase of the scan cycle.
    pub fn phase(&self) -> ScanPhase {
        self.phase
            .lock()
            .map(|phase| *phase)
            .unwrap_or(ScanPhase::Idle)
    }

    fn set_phase(&self, phase: ScanPhase) {
        if let Ok(mut current) = self.phase.lock() {
            if *current != phase {
                debug!("Scan phase {:?} -> {:?}", *current, phase);
                *current = phase;
            }
        }
    }

    fn cursor_key(&self) -> CursorKey {
        CursorKey {
            chain: self.cashier.chain(),
            cashier: self.cashier.cashier_address(),
        }
    }

    /// Runs the polling loop until `shutdown` fires or a fatal error occurs.
    ///
    /// The cashier and recorder connections are closed on every return path.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Stopped on request
    /// * `Err(WitnessError)` - A fatal error (storage failure or corrupt record) ended the loop;
    ///   an operator alert has been sent
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> WitnessResult<()> {
        info!(
            "Witness service starting: chain={} cashier={:?} witness={:?} batch_size={} interval={:?}",
            self.cashier.chain(),
            self.cashier.cashier_address(),
            self.signer.address(),
            self.settings.batch_size,
            self.settings.interval
        );

        let result = self.run_loop(&mut shutdown).await;

        self.cashier.close().await;
        self.recorder.close().await;
        self.set_phase(ScanPhase::Idle);
        info!("Witness service stopped");
        result
    }

    async fn run_loop(&self, shutdown: &mut ShutdownSignal) -> WitnessResult<()> {
        loop {
            if shutdown.is_stopped() {
                return Ok(());
            }

            match self.process_cycle(shutdown).await {
                Ok(CycleOutcome::Scanned { from, to, transfers }) => {
                    info!("Scanned blocks ({}, {}]: {} transfers", from, to, transfers);
                }
                Ok(CycleOutcome::CaughtUp { cursor }) => {
                    debug!("Caught up at height {}", cursor);
                }
                Ok(CycleOutcome::Interrupted { cursor }) => {
                    info!("Stop requested, cursor left at {}", cursor);
                    return Ok(());
                }
                Err(e) if e.is_fatal() => {
                    error!("Fatal error in witness loop: {}", e);
                    self.alerter
                        .alert(&format!("witness service stopping: {}", e))
                        .await;
                    return Err(e);
                }
                Err(e) if e.is_transient() => {
                    warn!("Dependency unavailable, retrying next tick: {}", e);
                }
                Err(e) => {
                    warn!("Witness cycle failed, retrying next tick: {}", e);
                }
            }

            self.set_phase(ScanPhase::Idle);
            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {}
                _ = shutdown.stopped() => return Ok(()),
            }
        }
    }

    /// Runs one scan cycle.
    ///
    /// Public so tests and tools can drive the loop step by step.
    #[doc(hidden)]
    pub async fn process_cycle(&self, shutdown: &ShutdownSignal) -> WitnessResult<CycleOutcome> {
        self.retry_submissions(shutdown).await?;
        self.check_settlements(shutdown).await?;

        let key = self.cursor_key();
        let cursor = match self.recorder.get_cursor(&key).await? {
            Some(cursor) => cursor,
            None => self.settings.start_block_height.saturating_sub(1),
        };

        self.set_phase(ScanPhase::Fetching);
        let head = self.cashier.finalized_head().await?;
        let to = cursor.saturating_add(self.settings.batch_size).min(head);
        if to <= cursor {
            return Ok(CycleOutcome::CaughtUp { cursor });
        }

        let pulled = self.cashier.pull_transfers(cursor + 1, to).await?;
        // The backend may see a lower head than the one read above.
        let scanned_to = pulled.to.min(to);
        if scanned_to <= cursor {
            debug!("Cashier covered nothing after {} (asked for {})", cursor, to);
            return Ok(CycleOutcome::CaughtUp { cursor });
        }
        if scanned_to < to {
            warn!(
                "Cashier covered ({}, {}] of requested ({}, {}]",
                cursor, scanned_to, cursor, to
            );
        }
        let mut events = pulled.events;
        sort_events(&mut events);
        debug!("Pulled {} events in ({}, {}]", events.len(), cursor, scanned_to);

        let mut relayer_up = true;
        let mut transfers = 0;
        for event in events {
            if shutdown.is_stopped() {
                return Ok(CycleOutcome::Interrupted { cursor });
            }

            match event {
                PulledEvent::Transfer(transfer) => {
                    transfers += 1;
                    relayer_up = self.process_transfer(transfer, relayer_up).await? && relayer_up;
                }
                PulledEvent::Malformed(malformed) => {
                    warn!(
                        "Skipping malformed event at height {} log {}: {}",
                        malformed.block_height, malformed.log_index, malformed.reason
                    );
                    self.alerter
                        .alert(&format!(
                            "malformed cashier event on {} at height {} log {}: {}",
                            key.chain, malformed.block_height, malformed.log_index, malformed.reason
                        ))
                        .await;
                }
            }
        }

        self.recorder.set_cursor(&key, scanned_to).await?;
        Ok(CycleOutcome::Scanned {
            from: cursor,
            to: scanned_to,
            transfers,
        })
    }

    /// Records, validates, signs and submits one transfer, resuming from its stored status.
    ///
    /// Returns whether the relayer should still be tried during this cycle.
    async fn process_transfer(&self, transfer: Transfer, relayer_up: bool) -> WitnessResult<bool> {
        let key = transfer.key();

        self.set_phase(ScanPhase::Recording);
        let is_new = self.recorder.record_transfer(&transfer).await?;
        let record = self
            .recorder
            .get_record(&key)
            .await?
            .ok_or_else(|| WitnessError::CorruptRecord(format!("record {} vanished", key)))?;

        if !is_new {
            if record.transfer != transfer {
                warn!(
                    "Transfer {} observed again with different content (stored tx {:?}, new tx {:?})",
                    key, record.transfer.tx_hash, transfer.tx_hash
                );
            }
            if record.status.is_settled_for_scan() {
                debug!("Transfer {} already {}, skipping", key, record.status);
                return Ok(true);
            }
            info!("Resuming transfer {} from status {}", key, record.status);
        }

        // Work from the stored copy so a resumed record is signed exactly as first recorded.
        let transfer = &record.transfer;

        self.set_phase(ScanPhase::Validating);
        let id = match (record.status, record.id) {
            (TransferStatus::Validated, Some(id)) => id,
            _ => match self.validate(transfer).await {
                Ok(id) => {
                    self.recorder.mark_validated(&key, &id).await?;
                    id
                }
                Err(WitnessError::InvalidTransfer(reason)) => {
                    warn!("Rejecting transfer {}: {}", key, reason);
                    self.recorder.update_status(&key, TransferStatus::Failed).await?;
                    return Ok(true);
                }
                Err(e) => return Err(e),
            },
        };

        self.set_phase(ScanPhase::Signing);
        let signature = match record.signature {
            Some(ref signature) => signature.clone(),
            None => self.signer.sign(&id)?,
        };

        self.set_phase(ScanPhase::Recording);
        self.recorder.mark_signed(&key, &signature).await?;
        info!("Witnessed transfer {} id {:?}", key, id);

        if !relayer_up {
            debug!("Relayer down this cycle, leaving {} signed", key);
            return Ok(false);
        }

        let signed = WitnessRecord {
            status: TransferStatus::Signed,
            id: Some(id),
            signature: Some(signature),
            ..record
        };
        self.submit(&signed).await
    }

    /// Checks a transfer against the bridge policy and derives its attestation id.
    async fn validate(&self, transfer: &Transfer) -> WitnessResult<H256> {
        if transfer.chain != self.cashier.chain()
            || transfer.cashier != self.cashier.cashier_address()
        {
            return Err(WitnessError::InvalidTransfer(format!(
                "emitted by {}:{:?}, expected {}:{:?}",
                transfer.chain,
                transfer.cashier,
                self.cashier.chain(),
                self.cashier.cashier_address()
            )));
        }
        if transfer.recipient.is_zero() {
            return Err(WitnessError::InvalidTransfer(
                "recipient is the zero address".to_string(),
            ));
        }
        if transfer.amount.is_zero() {
            return Err(WitnessError::InvalidTransfer("amount is zero".to_string()));
        }

        let pair = self
            .recorder
            .token_pair(&transfer.token)
            .await?
            .ok_or_else(|| {
                WitnessError::InvalidTransfer(format!(
                    "token {:?} has no registered pair",
                    transfer.token
                ))
            })?;

        Ok(transfer.id(&self.settings.validator, &pair.co_token))
    }

    /// Submits a signed record.
    ///
    /// Returns `false` when the relayer is unreachable, leaving the record `Signed`.
    async fn submit(&self, record: &WitnessRecord) -> WitnessResult<bool> {
        self.set_phase(ScanPhase::Submitting);
        let key = record.transfer.key();
        let submission = WitnessSubmission::from_record(record, &self.signer.address())?;

        match self.relayer.submit(&submission).await {
            Ok(()) => {
                self.recorder.update_status(&key, TransferStatus::Submitted).await?;
                Ok(true)
            }
            Err(WitnessError::RelayerUnavailable(reason)) => {
                warn!("Relayer unavailable, {} stays signed: {}", key, reason);
                Ok(false)
            }
            Err(WitnessError::InvalidTransfer(reason)) => {
                self.recorder.update_status(&key, TransferStatus::Failed).await?;
                self.alerter
                    .alert(&format!("relayer rejected witness for {}: {}", key, reason))
                    .await;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Resubmits every `Signed` record with its stored signature.
    async fn retry_submissions(&self, shutdown: &ShutdownSignal) -> WitnessResult<()> {
        let key = self.cursor_key();
        let pending = self
            .recorder
            .records_with_status(key.chain, &key.cashier, TransferStatus::Signed)
            .await?;
        if pending.is_empty() {
            return Ok(());
        }

        info!("Retrying submission of {} signed transfers", pending.len());
        for record in pending {
            if shutdown.is_stopped() {
                break;
            }
            if !self.submit(&record).await? {
                break;
            }
        }
        Ok(())
    }

    /// Asks the relayer about the least recently checked `Submitted` records.
    ///
    /// Settled records become `Confirmed`. Records the relayer does not know
    /// go back to `Signed` so the next cycle resubmits the stored signature.
    async fn check_settlements(&self, shutdown: &ShutdownSignal) -> WitnessResult<()> {
        let key = self.cursor_key();
        let candidates = self
            .recorder
            .settlement_candidates(
                key.chain,
                &key.cashier,
                self.settings.settlement_checks_per_cycle,
            )
            .await?;

        for record in candidates {
            if shutdown.is_stopped() {
                break;
            }
            let transfer_key = record.transfer.key();
            let Some(id) = record.id else {
                warn!("Submitted transfer {} has no id, skipping check", transfer_key);
                self.recorder.mark_checked(&transfer_key).await?;
                continue;
            };
            match self
                .relayer
                .check(&format!("0x{}", hex::encode(id.as_bytes())))
                .await
            {
                Ok(SettlementStatus::Settled) => {
                    self.recorder
                        .update_status(&transfer_key, TransferStatus::Confirmed)
                        .await?;
                    info!("Transfer {} settled", transfer_key);
                }
                Ok(SettlementStatus::Pending) => {
                    self.recorder.mark_checked(&transfer_key).await?;
                }
                Ok(SettlementStatus::Unknown) => {
                    warn!(
                        "Relayer has no witness for {}, requeueing for resubmission",
                        transfer_key
                    );
                    self.recorder
                        .update_status(&transfer_key, TransferStatus::Signed)
                        .await?;
                }
                Err(e) => {
                    debug!("Settlement check deferred: {}", e);
                    break;
                }
            }
        }
        Ok(())
    }
}
