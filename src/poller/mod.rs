//! Confirmation poller: watches broadcast transactions until they are final
//!
//! A transfer leaves `submitted` only when its transaction has enough
//! confirmations on the destination chain. Reverted and dropped transactions
//! go back through the submission pipeline; recently confirmed transfers are
//! re-checked for a window in case a reorg removed the confirming block.

use crate::chain::{GatewayManager, ReceiptLookup, TxStatus};
use crate::config::RelayConfig;
use crate::error::RelayResult;
use crate::ledger::{Ledger, TransferRecord};
use crate::metrics;
use crate::nonce::NonceSequencer;
use crate::pipeline::backoff_delay;

use chrono::{Duration as ChronoDuration, Utc};
use ethers::types::Address;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

pub struct ConfirmationPoller {
    ledger: Arc<dyn Ledger>,
    gateways: Arc<GatewayManager>,
    sequencer: Arc<NonceSequencer>,
    config: RelayConfig,
    /// Required confirmation depth per destination chain.
    confirmation_depths: HashMap<u64, u64>,
    account: Address,
    shutdown: Arc<RwLock<bool>>,
}

impl ConfirmationPoller {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        gateways: Arc<GatewayManager>,
        sequencer: Arc<NonceSequencer>,
        config: RelayConfig,
        confirmation_depths: HashMap<u64, u64>,
        account: Address,
    ) -> Self {
        Self {
            ledger,
            gateways,
            sequencer,
            config,
            confirmation_depths,
            account,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn run(&self) -> RelayResult<()> {
        let mut tick = interval(Duration::from_secs(
            self.config.confirmation_poll_interval_secs.max(1),
        ));
        info!("Confirmation poller started");

        loop {
            if *self.shutdown.read().await {
                break;
            }
            tick.tick().await;
            if let Err(e) = self.poll_once().await {
                warn!("Confirmation poll failed: {}", e);
            }
        }

        info!("Confirmation poller stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }

    pub async fn poll_once(&self) -> RelayResult<()> {
        self.check_submitted().await?;
        self.check_reorgs().await?;
        Ok(())
    }

    /// Walk `submitted` transfers old enough to have a receipt and settle
    /// each against its destination chain.
    async fn check_submitted(&self) -> RelayResult<()> {
        let cutoff =
            Utc::now() - ChronoDuration::seconds(self.config.min_confirmation_delay_secs as i64);
        let pending = self.ledger.submitted_before(cutoff).await?;

        for record in pending {
            if let Err(e) = self.settle_one(&record).await {
                warn!(
                    "Settling transfer {} failed: {}",
                    record.request_id_hex(),
                    e
                );
            }
        }
        Ok(())
    }

    async fn settle_one(&self, record: &TransferRecord) -> RelayResult<()> {
        let Some(tx_hash) = record.tx_hash else {
            // A submitted row always carries a hash; treat its absence as a
            // corrupted row and fail it rather than loop forever.
            warn!(
                "Submitted transfer {} has no transaction hash",
                record.request_id_hex()
            );
            self.ledger.mark_failed(&record.id).await?;
            metrics::record_transfer_failed(record.dest_chain);
            return Ok(());
        };

        let gateway = self.gateways.get(record.dest_chain)?;
        match gateway.get_receipt(tx_hash).await? {
            ReceiptLookup::Mined {
                status: TxStatus::Success,
                confirmations,
                block_number,
            } => {
                let required = self.required_depth(record.dest_chain);
                if confirmations >= required {
                    self.ledger.mark_confirmed(&record.id).await?;
                    metrics::record_transfer_confirmed(record.dest_chain);
                    info!(
                        "Transfer {} confirmed on chain {} in block {} ({} confirmations)",
                        record.request_id_hex(),
                        record.dest_chain,
                        block_number,
                        confirmations
                    );
                } else {
                    debug!(
                        "Transfer {} at {}/{} confirmations",
                        record.request_id_hex(),
                        confirmations,
                        required
                    );
                }
            }

            ReceiptLookup::Mined {
                status: TxStatus::Reverted,
                ..
            } => {
                // The revert consumed the nonce on-chain, so the slot is not
                // returned to the sequencer.
                warn!(
                    "Transfer {} reverted on chain {}",
                    record.request_id_hex(),
                    record.dest_chain
                );
                self.reopen_or_fail(record).await?;
            }

            ReceiptLookup::NotFound => {
                let age = Utc::now() - record.updated_at;
                if age > ChronoDuration::seconds(self.config.receipt_timeout_secs as i64) {
                    // Dropped from the mempool; the nonce was never consumed.
                    warn!(
                        "Transfer {} dropped on chain {} after {}s without a receipt",
                        record.request_id_hex(),
                        record.dest_chain,
                        age.num_seconds()
                    );
                    if let Some(nonce) = record.nonce {
                        match self
                            .sequencer
                            .release(record.dest_chain, self.account, nonce)
                            .await
                        {
                            Ok(()) => metrics::record_nonce_released(record.dest_chain),
                            Err(e) => debug!("Nonce release skipped: {}", e),
                        }
                    }
                    self.reopen_or_fail(record).await?;
                }
            }
        }
        Ok(())
    }

    /// Re-check recently confirmed transfers; a reorg can remove the
    /// confirming block after we saw it.
    async fn check_reorgs(&self) -> RelayResult<()> {
        let cutoff =
            Utc::now() - ChronoDuration::seconds(self.config.reconfirm_window_secs as i64);
        let recent = self.ledger.confirmed_since(cutoff).await?;

        for record in recent {
            let Some(tx_hash) = record.tx_hash else {
                continue;
            };
            let gateway = self.gateways.get(record.dest_chain)?;
            let reopen = match gateway.get_receipt(tx_hash).await {
                Ok(ReceiptLookup::NotFound) => true,
                Ok(ReceiptLookup::Mined {
                    status: TxStatus::Reverted,
                    ..
                }) => true,
                Ok(ReceiptLookup::Mined { .. }) => false,
                Err(e) => {
                    warn!(
                        "Reconfirmation check for {} failed: {}",
                        record.request_id_hex(),
                        e
                    );
                    false
                }
            };

            if reopen {
                warn!(
                    "Reorg removed confirmation of transfer {} on chain {}",
                    record.request_id_hex(),
                    record.dest_chain
                );
                self.ledger.reopen_confirmed(&record.id).await?;
                metrics::record_transfer_reopened(record.dest_chain);
            }
        }
        Ok(())
    }

    /// Return a settled-bad transfer to the submission queue, or fail it once
    /// the retry limit is reached.
    async fn reopen_or_fail(&self, record: &TransferRecord) -> RelayResult<()> {
        let attempts_made = record.retry_count + 1;
        if attempts_made >= self.config.max_retries {
            self.ledger.mark_failed(&record.id).await?;
            metrics::record_transfer_failed(record.dest_chain);
            return Ok(());
        }

        let delay = backoff_delay(
            record.retry_count,
            self.config.retry_base_delay_ms,
            self.config.retry_max_delay_ms,
        );
        self.ledger
            .release_submission(&record.id, Utc::now() + delay)
            .await?;
        metrics::record_transfer_retried(record.dest_chain);
        Ok(())
    }

    fn required_depth(&self, chain_id: u64) -> u64 {
        self.confirmation_depths.get(&chain_id).copied().unwrap_or(12)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::FakeGateway;
    use crate::chain::ChainGateway;
    use crate::ledger::{MemoryLedger, TransferState};
    use ethers::types::{H256, U256};

    fn relay_config() -> RelayConfig {
        RelayConfig {
            instance_id: "test".to_string(),
            worker_count: 4,
            poll_interval_ms: 10,
            max_retries: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 1000,
            submitting_grace_secs: 60,
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

    fn submitted_record(id_byte: u8, nonce: u64, tx_hash: H256) -> TransferRecord {
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
            nonce: Some(nonce),
            tx_hash: Some(tx_hash),
            state: TransferState::Submitted,
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
        poller: ConfirmationPoller,
    }

    fn fixture_with(config: RelayConfig, depth: u64) -> Fixture {
        let ledger = Arc::new(MemoryLedger::new());
        let gateway = Arc::new(FakeGateway::new(137));
        let sequencer = Arc::new(NonceSequencer::new());
        sequencer.initialize(137, account(), 0, None);
        let gateways = Arc::new(GatewayManager::from_gateways(vec![
            gateway.clone() as Arc<dyn ChainGateway>
        ]));
        let poller = ConfirmationPoller::new(
            ledger.clone(),
            gateways,
            sequencer.clone(),
            config,
            HashMap::from([(137u64, depth)]),
            account(),
        );
        Fixture {
            ledger,
            gateway,
            sequencer,
            poller,
        }
    }

    fn fixture(depth: u64) -> Fixture {
        fixture_with(relay_config(), depth)
    }

    async fn assert_confirms_at_depth(depth: u64) {
        let f = fixture(depth);
        let tx_hash = H256::repeat_byte(0xaa);
        let record = submitted_record(1, 0, tx_hash);
        f.ledger.insert_accepted(record.clone()).await.unwrap();

        f.gateway.script_receipts(
            tx_hash,
            vec![
                ReceiptLookup::Mined {
                    status: TxStatus::Success,
                    block_number: 100,
                    confirmations: depth - 1,
                },
                ReceiptLookup::Mined {
                    status: TxStatus::Success,
                    block_number: 100,
                    confirmations: depth,
                },
            ],
        );

        // One short of the required depth: still submitted.
        f.poller.poll_once().await.unwrap();
        let stored = f.ledger.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Submitted);

        f.poller.poll_once().await.unwrap();
        let stored = f.ledger.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Confirmed);
    }

    #[tokio::test]
    async fn confirms_once_depth_is_reached_shallow_chain() {
        assert_confirms_at_depth(3).await;
    }

    #[tokio::test]
    async fn confirms_once_depth_is_reached_deep_chain() {
        assert_confirms_at_depth(12).await;
    }

    #[tokio::test]
    async fn reverted_transaction_is_rescheduled_without_its_nonce() {
        let f = fixture(3);
        let tx_hash = H256::repeat_byte(0xaa);
        // Nonce 0 was reserved for the original attempt and consumed by the
        // revert.
        f.sequencer.reserve(137, account()).await.unwrap();
        let record = submitted_record(1, 0, tx_hash);
        f.ledger.insert_accepted(record.clone()).await.unwrap();

        f.gateway.script_receipts(
            tx_hash,
            vec![ReceiptLookup::Mined {
                status: TxStatus::Reverted,
                block_number: 100,
                confirmations: 5,
            }],
        );

        f.poller.poll_once().await.unwrap();

        let stored = f.ledger.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Accepted);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.nonce, None);
        // The consumed slot stays consumed.
        assert_eq!(f.sequencer.reserve(137, account()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn revert_with_exhausted_retries_fails_terminally() {
        let mut config = relay_config();
        config.max_retries = 1;
        let f = fixture_with(config, 3);
        let tx_hash = H256::repeat_byte(0xaa);
        let record = submitted_record(1, 0, tx_hash);
        f.ledger.insert_accepted(record.clone()).await.unwrap();

        f.gateway.script_receipts(
            tx_hash,
            vec![ReceiptLookup::Mined {
                status: TxStatus::Reverted,
                block_number: 100,
                confirmations: 5,
            }],
        );

        f.poller.poll_once().await.unwrap();

        let stored = f.ledger.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Failed);
    }

    #[tokio::test]
    async fn dropped_transaction_releases_its_nonce_after_timeout() {
        let mut config = relay_config();
        config.receipt_timeout_secs = 0;
        let f = fixture_with(config, 3);
        let tx_hash = H256::repeat_byte(0xaa);
        f.sequencer.reserve(137, account()).await.unwrap();
        let record = submitted_record(1, 0, tx_hash);
        f.ledger.insert_accepted(record.clone()).await.unwrap();
        // No scripted receipt: the lookup returns NotFound.

        f.poller.poll_once().await.unwrap();

        let stored = f.ledger.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Accepted);
        assert_eq!(stored.retry_count, 1);
        // A dropped transaction never consumed its nonce.
        assert_eq!(f.sequencer.reserve(137, account()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_receipt_within_timeout_keeps_waiting() {
        let f = fixture(3);
        let tx_hash = H256::repeat_byte(0xaa);
        let record = submitted_record(1, 0, tx_hash);
        f.ledger.insert_accepted(record.clone()).await.unwrap();

        f.poller.poll_once().await.unwrap();

        let stored = f.ledger.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Submitted);
    }

    #[tokio::test]
    async fn reorg_reopens_a_confirmed_transfer() {
        let f = fixture(3);
        let tx_hash = H256::repeat_byte(0xaa);
        let mut record = submitted_record(1, 0, tx_hash);
        record.state = TransferState::Confirmed;
        f.ledger.insert_accepted(record.clone()).await.unwrap();
        // No scripted receipt: the confirming block is gone.

        f.poller.poll_once().await.unwrap();

        let stored = f.ledger.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Submitted);
    }

    #[tokio::test]
    async fn confirmed_transfer_outside_the_window_is_left_alone() {
        let mut config = relay_config();
        config.reconfirm_window_secs = 0;
        let f = fixture_with(config, 3);
        let tx_hash = H256::repeat_byte(0xaa);
        let mut record = submitted_record(1, 0, tx_hash);
        record.state = TransferState::Confirmed;
        f.ledger.insert_accepted(record.clone()).await.unwrap();

        f.poller.poll_once().await.unwrap();

        let stored = f.ledger.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Confirmed);
    }
}
