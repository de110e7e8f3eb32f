//! Submission pipeline: background workers that turn accepted transfers into
//! broadcast transactions
//!
//! Workers coordinate only through the ledger's compare-and-set claim and
//! the nonce sequencer; there is no global lock. A claimed row stays in
//! `submitting` across the gateway call because the claim is the
//! work-in-progress ownership. Crashed workers are handled by the recovery
//! sweep, which reopens abandoned `submitting` rows.

use crate::chain::{GatewayManager, TransferTransaction};
use crate::config::RelayConfig;
use crate::dispatch::WorkItem;
use crate::error::{RelayError, RelayResult};
use crate::ledger::{Ledger, TransferRecord, TransferState};
use crate::metrics;
use crate::nonce::NonceSequencer;

use chrono::{Duration as ChronoDuration, Utc};
use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

/// Exponential backoff with a cap. Attempt 0 waits the base delay.
pub fn backoff_delay(retry_count: u32, base_ms: u64, max_ms: u64) -> ChronoDuration {
    let shift = retry_count.min(16);
    let delay_ms = base_ms.saturating_mul(1u64 << shift).min(max_ms);
    ChronoDuration::milliseconds(delay_ms as i64)
}

pub struct SubmissionPipeline {
    ledger: Arc<dyn Ledger>,
    gateways: Arc<GatewayManager>,
    sequencer: Arc<NonceSequencer>,
    config: RelayConfig,
    /// The relay's submitting account, shared across chains.
    account: Address,
    shutdown: Arc<RwLock<bool>>,
}

impl SubmissionPipeline {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        gateways: Arc<GatewayManager>,
        sequencer: Arc<NonceSequencer>,
        config: RelayConfig,
        account: Address,
    ) -> Self {
        Self {
            ledger,
            gateways,
            sequencer,
            config,
            account,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Seed the nonce sequencer for every chain from the on-chain nonce and
    /// the highest nonce already bound in the ledger. Must run before any
    /// submission after a restart.
    pub async fn initialize_nonces(&self) -> RelayResult<()> {
        for chain_id in self.gateways.chain_ids() {
            self.resync_nonce(chain_id).await?;
        }
        Ok(())
    }

    /// Reseed one chain's counter from the chain head and the ledger,
    /// discarding any locally released slots.
    async fn resync_nonce(&self, chain_id: u64) -> RelayResult<()> {
        let gateway = self.gateways.get(chain_id)?;
        let on_chain = gateway.get_nonce(self.account).await?;
        let max_bound = self.ledger.max_bound_nonce(chain_id).await?;
        self.sequencer
            .initialize(chain_id, self.account, on_chain, max_bound);
        Ok(())
    }

    /// Main worker loop: reacts to dispatched work, scans for due rows, and
    /// periodically runs the recovery sweep.
    pub async fn run(&self, mut work_rx: mpsc::Receiver<WorkItem>) -> RelayResult<()> {
        // Reclaim anything a previous process left mid-flight.
        match self.recovery_sweep().await {
            Ok(reopened) if reopened > 0 => {
                info!("Startup recovery reopened {} transfers", reopened)
            }
            Ok(_) => {}
            Err(e) => error!("Startup recovery sweep failed: {}", e),
        }

        let mut process_interval = interval(Duration::from_millis(self.config.poll_interval_ms));
        let mut sweep_interval =
            interval(Duration::from_secs(self.config.submitting_grace_secs.max(1)));

        info!("Submission pipeline started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                Some(item) = work_rx.recv() => {
                    let WorkItem::SubmitTransfer(id) = item;
                    if let Err(e) = self.handle_work_item(id).await {
                        if e.should_alert() {
                            error!("Pipeline halted on shared-state failure: {}", e);
                            return Err(e);
                        }
                        warn!("Work item failed: {}", e);
                    }
                }

                _ = process_interval.tick() => {
                    if let Err(e) = self.process_due().await {
                        if e.should_alert() {
                            error!("Pipeline halted on shared-state failure: {}", e);
                            return Err(e);
                        }
                        warn!("Error processing due transfers: {}", e);
                    }
                }

                _ = sweep_interval.tick() => {
                    if let Err(e) = self.recovery_sweep().await {
                        warn!("Recovery sweep failed: {}", e);
                    }
                }
            }
        }

        info!("Submission pipeline stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }

    /// A dispatched work item names one transfer. Delivery is at-least-once,
    /// so a duplicate simply loses the claim race and becomes a no-op.
    async fn handle_work_item(&self, id: [u8; 32]) -> RelayResult<()> {
        let Some(record) = self.ledger.get(&id).await? else {
            warn!("Dispatched transfer {} not in ledger", hex::encode(id));
            return Ok(());
        };
        if record.state != TransferState::Accepted || record.next_attempt_at > Utc::now() {
            return Ok(());
        }
        self.submit_one(&record).await
    }

    /// Claim and submit every due `accepted` row, one batch per tick.
    pub async fn process_due(&self) -> RelayResult<usize> {
        let due = self
            .ledger
            .due_for_submission(Utc::now(), self.config.worker_count as i64)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut processed = 0;
        let results =
            futures::future::join_all(due.iter().map(|record| self.submit_one(record))).await;
        for (record, result) in due.iter().zip(results) {
            match result {
                Ok(()) => processed += 1,
                Err(e) => {
                    if e.should_alert() {
                        return Err(e);
                    }
                    warn!(
                        "Submission of {} failed: {}",
                        record.request_id_hex(),
                        e
                    );
                }
            }
        }
        Ok(processed)
    }

    /// Drive one transfer from `accepted` through a submission attempt.
    ///
    /// Errors returned here are infrastructure failures around the ledger or
    /// sequencer; failures of the transaction itself are absorbed into the
    /// transfer's own state.
    pub async fn submit_one(&self, record: &TransferRecord) -> RelayResult<()> {
        let claimed = self
            .ledger
            .claim(&record.id, TransferState::Accepted, TransferState::Submitting)
            .await?;
        if !claimed {
            // Another worker owns it.
            debug!("Lost claim race for {}", record.request_id_hex());
            return Ok(());
        }

        let gateway = self.gateways.get(record.dest_chain)?;

        let nonce = match self.sequencer.reserve(record.dest_chain, self.account).await {
            Ok(nonce) => nonce,
            Err(e) => {
                // Hand the row back untouched; without a nonce nothing was
                // attempted.
                self.ledger
                    .claim(&record.id, TransferState::Submitting, TransferState::Accepted)
                    .await?;
                return Err(e);
            }
        };
        self.ledger.record_attempt(&record.id, nonce).await?;

        let tx = TransferTransaction {
            chain_id: record.dest_chain,
            transfer_id: record.id,
            token: record.token,
            recipient: record.recipient,
            amount: record.amount,
            nonce,
        };

        match gateway.submit_transaction(&tx).await {
            Ok(tx_hash) => {
                // The nonce is permanently bound from here on.
                self.ledger.mark_submitted(&record.id, tx_hash).await?;
                metrics::record_transfer_submitted(record.dest_chain);
                let latency = (Utc::now() - record.created_at).num_milliseconds() as f64 / 1000.0;
                metrics::record_submission_latency(record.dest_chain, latency);
                info!(
                    "Submitted transfer {} on chain {} as {:?} (nonce {})",
                    record.request_id_hex(),
                    record.dest_chain,
                    tx_hash,
                    nonce
                );
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                // Never broadcast: the nonce slot goes back to the pool.
                self.sequencer
                    .release(record.dest_chain, self.account, nonce)
                    .await?;
                metrics::record_nonce_released(record.dest_chain);
                self.retry_or_fail(record, &e).await
            }
            Err(e) => {
                if matches!(e, RelayError::Nonce { .. }) {
                    // The chain already owns this nonce; putting the slot
                    // back would hand a consumed value to the next transfer.
                    // Discard it and reseed the counter from the chain.
                    if let Err(sync_err) = self.resync_nonce(record.dest_chain).await {
                        warn!(
                            "Nonce resync for chain {} failed: {}",
                            record.dest_chain, sync_err
                        );
                    }
                } else {
                    self.sequencer
                        .release(record.dest_chain, self.account, nonce)
                        .await?;
                    metrics::record_nonce_released(record.dest_chain);
                }
                warn!(
                    "Permanent submission failure for {}: {}",
                    record.request_id_hex(),
                    e
                );
                self.ledger.mark_failed(&record.id).await?;
                metrics::record_transfer_failed(record.dest_chain);
                Ok(())
            }
        }
    }

    /// Schedule another attempt under the backoff schedule, or fail
    /// terminally once the retry limit is reached.
    async fn retry_or_fail(&self, record: &TransferRecord, cause: &RelayError) -> RelayResult<()> {
        let attempts_made = record.retry_count + 1;
        if attempts_made >= self.config.max_retries {
            warn!(
                "Transfer {} failed after {} attempts: {}",
                record.request_id_hex(),
                attempts_made,
                cause
            );
            self.ledger.mark_failed(&record.id).await?;
            metrics::record_transfer_failed(record.dest_chain);
            return Ok(());
        }

        let delay = backoff_delay(
            record.retry_count,
            self.config.retry_base_delay_ms,
            self.config.retry_max_delay_ms,
        );
        debug!(
            "Transfer {} attempt {} failed ({}), retrying in {}ms",
            record.request_id_hex(),
            attempts_made,
            cause,
            delay.num_milliseconds()
        );
        self.ledger
            .release_submission(&record.id, Utc::now() + delay)
            .await?;
        metrics::record_transfer_retried(record.dest_chain);
        Ok(())
    }

    /// Reopen `submitting` rows abandoned past the grace period. A row that
    /// already carries a transaction hash was broadcast before the crash and
    /// is promoted to `submitted`; anything else goes back to `accepted`
    /// with its nonce released.
    pub async fn recovery_sweep(&self) -> RelayResult<usize> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.submitting_grace_secs as i64);
        let stale = self.ledger.stale_submitting(cutoff).await?;
        let mut reopened = 0;

        for record in stale {
            if record.tx_hash.is_some() {
                if self
                    .ledger
                    .claim(&record.id, TransferState::Submitting, TransferState::Submitted)
                    .await?
                {
                    info!(
                        "Recovery promoted {} to submitted (hash already recorded)",
                        record.request_id_hex()
                    );
                    reopened += 1;
                }
                continue;
            }

            if let Some(nonce) = record.nonce {
                if let Err(e) = self
                    .sequencer
                    .release(record.dest_chain, self.account, nonce)
                    .await
                {
                    // Sequencer may have been reseeded past this value.
                    debug!("Recovery nonce release skipped: {}", e);
                } else {
                    metrics::record_nonce_released(record.dest_chain);
                }
            }
            self.retry_or_fail(
                &record,
                &RelayError::Timeout {
                    operation: "submission worker".to_string(),
                },
            )
            .await?;
            metrics::record_transfer_recovered(record.dest_chain);
            reopened += 1;
        }

        Ok(reopened)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::FakeGateway;
    use crate::chain::ChainGateway;
    use crate::ledger::MemoryLedger;
    use ethers::types::{H256, U256};

    fn relay_config(max_retries: u32) -> RelayConfig {
        RelayConfig {
            instance_id: "test".to_string(),
            worker_count: 4,
            poll_interval_ms: 10,
            max_retries,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 1000,
            submitting_grace_secs: 0,
            confirmation_poll_interval_secs: 1,
            min_confirmation_delay_secs: 0,
            receipt_timeout_secs: 600,
            reconfirm_window_secs: 3600,
            health_check_interval_secs: 30,
        }
    }

    fn account() -> Address {
        Address::repeat_byte(0x42)
    }

    fn accepted_record(id_byte: u8) -> TransferRecord {
        let now = Utc::now();
        TransferRecord {
            id: [id_byte; 32],
            source_chain: 1,
            dest_chain: 137,
            sender: Address::repeat_byte(0x11),
            recipient: Address::repeat_byte(0x22),
            token: Address::repeat_byte(0x33),
            amount: U256::from(100u64),
            fee: U256::from(10u64),
            bid_id: [0xbb; 32],
            nonce: None,
            tx_hash: None,
            state: TransferState::Accepted,
            retry_count: 0,
            next_attempt_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        gateway: Arc<FakeGateway>,
        sequencer: Arc<NonceSequencer>,
        pipeline: SubmissionPipeline,
    }

    fn fixture(max_retries: u32) -> Fixture {
        let ledger = Arc::new(MemoryLedger::new());
        let gateway = Arc::new(FakeGateway::new(137));
        let sequencer = Arc::new(NonceSequencer::new());
        sequencer.initialize(137, account(), 0, None);
        let gateways = Arc::new(GatewayManager::from_gateways(vec![
            gateway.clone() as Arc<dyn ChainGateway>
        ]));
        let pipeline = SubmissionPipeline::new(
            ledger.clone(),
            gateways,
            sequencer.clone(),
            relay_config(max_retries),
            account(),
        );
        Fixture {
            ledger,
            gateway,
            sequencer,
            pipeline,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0, 100, 10_000).num_milliseconds(), 100);
        assert_eq!(backoff_delay(1, 100, 10_000).num_milliseconds(), 200);
        assert_eq!(backoff_delay(3, 100, 10_000).num_milliseconds(), 800);
        assert_eq!(backoff_delay(10, 100, 10_000).num_milliseconds(), 10_000);
        // No overflow at absurd retry counts.
        assert_eq!(backoff_delay(u32::MAX, 100, 10_000).num_milliseconds(), 10_000);
    }

    #[tokio::test]
    async fn accepted_transfer_becomes_submitted_with_bound_nonce() {
        let f = fixture(3);
        let record = accepted_record(1);
        f.ledger.insert_accepted(record.clone()).await.unwrap();

        f.pipeline.submit_one(&record).await.unwrap();

        let stored = f.ledger.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Submitted);
        assert_eq!(stored.nonce, Some(0));
        assert!(stored.tx_hash.is_some());
        assert_eq!(f.gateway.submission_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_delivery_submits_exactly_once() {
        let f = fixture(3);
        let record = accepted_record(1);
        f.ledger.insert_accepted(record.clone()).await.unwrap();

        f.pipeline.submit_one(&record).await.unwrap();
        // Second delivery of the same work item loses the claim race.
        f.pipeline.submit_one(&record).await.unwrap();

        assert_eq!(f.gateway.submission_count(), 1);
        let stored = f.ledger.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Submitted);
    }

    #[tokio::test]
    async fn transient_failure_releases_nonce_and_schedules_retry() {
        let f = fixture(3);
        let record = accepted_record(1);
        f.ledger.insert_accepted(record.clone()).await.unwrap();
        f.gateway.script_submit(Err(RelayError::Gateway {
            chain_id: 137,
            message: "connection reset".to_string(),
        }));

        f.pipeline.submit_one(&record).await.unwrap();

        let stored = f.ledger.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Accepted);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.nonce, None);
        assert!(stored.next_attempt_at > Utc::now());

        // The released nonce is the next one handed out.
        assert_eq!(f.sequencer.reserve(137, account()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn permanent_failure_is_terminal() {
        let f = fixture(3);
        let record = accepted_record(1);
        f.ledger.insert_accepted(record.clone()).await.unwrap();
        f.gateway.script_submit(Err(RelayError::TransactionRejected {
            chain_id: 137,
            message: "insufficient funds".to_string(),
        }));

        f.pipeline.submit_one(&record).await.unwrap();

        let stored = f.ledger.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Failed);
        assert_eq!(f.gateway.submission_count(), 0);
        // The transaction never reached the chain, so the slot is reusable.
        assert_eq!(f.sequencer.reserve(137, account()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn consumed_nonce_is_not_reissued_after_nonce_rejection() {
        let f = fixture(3);
        let first = accepted_record(1);
        let second = accepted_record(2);
        f.ledger.insert_accepted(first.clone()).await.unwrap();
        f.ledger.insert_accepted(second.clone()).await.unwrap();

        // The chain consumed nonce 0 in a broadcast this process never saw.
        f.gateway.set_on_chain_nonce(1);
        f.gateway.script_submit(Err(RelayError::Nonce {
            chain_id: 137,
            message: "nonce too low".to_string(),
        }));

        f.pipeline.submit_one(&first).await.unwrap();
        let stored = f.ledger.get(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Failed);

        // The next transfer gets a nonce the chain will accept, not the
        // consumed slot.
        f.pipeline.submit_one(&second).await.unwrap();
        let submissions = f.gateway.submitted();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].0.nonce, 1);
        let stored = f.ledger.get(&second.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Submitted);
    }

    #[tokio::test]
    async fn retries_exhaust_into_failure() {
        let f = fixture(2);
        let mut record = accepted_record(1);
        f.ledger.insert_accepted(record.clone()).await.unwrap();

        for _ in 0..2 {
            f.gateway.script_submit(Err(RelayError::Timeout {
                operation: "send".to_string(),
            }));
        }

        f.pipeline.submit_one(&record).await.unwrap();
        record = f.ledger.get(&record.id).await.unwrap().unwrap();
        assert_eq!(record.state, TransferState::Accepted);

        f.pipeline.submit_one(&record).await.unwrap();
        let stored = f.ledger.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Failed);
    }

    #[tokio::test]
    async fn recovery_sweep_reopens_abandoned_submitting_row() {
        let f = fixture(3);
        let mut record = accepted_record(1);
        record.state = TransferState::Submitting;
        record.nonce = Some(0);
        f.ledger.insert_accepted(record.clone()).await.unwrap();
        // Simulate the crashed worker's reservation.
        f.sequencer.reserve(137, account()).await.unwrap();

        let reopened = f.pipeline.recovery_sweep().await.unwrap();
        assert_eq!(reopened, 1);

        let stored = f.ledger.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Accepted);
        assert_eq!(stored.nonce, None);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(f.sequencer.reserve(137, account()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recovery_sweep_promotes_broadcast_row_to_submitted() {
        let f = fixture(3);
        let mut record = accepted_record(1);
        record.state = TransferState::Submitting;
        record.nonce = Some(0);
        record.tx_hash = Some(H256::repeat_byte(0xaa));
        f.ledger.insert_accepted(record.clone()).await.unwrap();

        let reopened = f.pipeline.recovery_sweep().await.unwrap();
        assert_eq!(reopened, 1);

        let stored = f.ledger.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Submitted);
        assert_eq!(stored.nonce, Some(0));
    }

    #[tokio::test]
    async fn initialize_nonces_reconciles_ledger_and_chain() {
        let f = fixture(3);
        // A submitted transfer already binds nonce 4; the chain only knows 2.
        let mut record = accepted_record(1);
        record.state = TransferState::Submitted;
        record.nonce = Some(4);
        record.tx_hash = Some(H256::repeat_byte(0xaa));
        f.ledger.insert_accepted(record).await.unwrap();
        f.gateway.set_on_chain_nonce(2);

        let sequencer = Arc::new(NonceSequencer::new());
        let gateways = Arc::new(GatewayManager::from_gateways(vec![
            f.gateway.clone() as Arc<dyn ChainGateway>
        ]));
        let pipeline = SubmissionPipeline::new(
            f.ledger.clone(),
            gateways,
            sequencer.clone(),
            relay_config(3),
            account(),
        );
        pipeline.initialize_nonces().await.unwrap();

        assert_eq!(sequencer.reserve(137, account()).await.unwrap(), 5);
    }
}
