//! In-memory ledger: a lock table plus the same transition rules as the
//! Postgres implementation
//!
//! Test double for `PgLedger`. The compare-and-set semantics and state
//! transition rules are identical, so pipeline and poller tests exercise
//! the same state machine the deployed store enforces.

use super::{InsertOutcome, Ledger, TransferRecord, TransferState, TransferStats};
use crate::bids::Bid;
use crate::error::{RelayError, RelayResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::H256;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryLedger {
    transfers: Mutex<HashMap<[u8; 32], TransferRecord>>,
    bids: Mutex<HashMap<[u8; 32], Bid>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_record<T>(
        &self,
        id: &[u8; 32],
        f: impl FnOnce(&mut TransferRecord) -> RelayResult<T>,
    ) -> RelayResult<T> {
        let mut transfers = self.transfers.lock().unwrap();
        let record = transfers
            .get_mut(id)
            .ok_or_else(|| RelayError::TransferNotFound {
                request_id: hex::encode(id),
            })?;
        let result = f(record)?;
        record.updated_at = Utc::now();
        Ok(result)
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn insert_accepted(&self, record: TransferRecord) -> RelayResult<InsertOutcome> {
        let mut transfers = self.transfers.lock().unwrap();
        if let Some(existing) = transfers.get(&record.id) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        transfers.insert(record.id, record.clone());
        Ok(InsertOutcome::Created(record))
    }

    async fn get(&self, id: &[u8; 32]) -> RelayResult<Option<TransferRecord>> {
        Ok(self.transfers.lock().unwrap().get(id).cloned())
    }

    async fn claim(
        &self,
        id: &[u8; 32],
        from: TransferState,
        to: TransferState,
    ) -> RelayResult<bool> {
        let mut transfers = self.transfers.lock().unwrap();
        match transfers.get_mut(id) {
            Some(record) if record.state == from => {
                record.state = to;
                record.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RelayError::TransferNotFound {
                request_id: hex::encode(id),
            }),
        }
    }

    async fn record_attempt(&self, id: &[u8; 32], nonce: u64) -> RelayResult<()> {
        self.with_record(id, |record| {
            record.nonce = Some(nonce);
            Ok(())
        })
    }

    async fn mark_submitted(&self, id: &[u8; 32], tx_hash: H256) -> RelayResult<()> {
        self.with_record(id, |record| {
            if record.state != TransferState::Submitting {
                return Err(RelayError::InvalidStateTransition {
                    from: record.state.to_string(),
                    to: TransferState::Submitted.to_string(),
                });
            }
            record.state = TransferState::Submitted;
            record.tx_hash = Some(tx_hash);
            Ok(())
        })
    }

    async fn release_submission(
        &self,
        id: &[u8; 32],
        next_attempt_at: DateTime<Utc>,
    ) -> RelayResult<()> {
        self.with_record(id, |record| {
            if record.state.is_terminal() || record.state == TransferState::Accepted {
                return Err(RelayError::InvalidStateTransition {
                    from: record.state.to_string(),
                    to: TransferState::Accepted.to_string(),
                });
            }
            record.state = TransferState::Accepted;
            record.nonce = None;
            record.tx_hash = None;
            record.retry_count += 1;
            record.next_attempt_at = next_attempt_at;
            Ok(())
        })
    }

    async fn mark_failed(&self, id: &[u8; 32]) -> RelayResult<()> {
        self.with_record(id, |record| {
            record.state = TransferState::Failed;
            Ok(())
        })
    }

    async fn mark_confirmed(&self, id: &[u8; 32]) -> RelayResult<()> {
        self.with_record(id, |record| {
            if record.state != TransferState::Submitted {
                return Err(RelayError::InvalidStateTransition {
                    from: record.state.to_string(),
                    to: TransferState::Confirmed.to_string(),
                });
            }
            record.state = TransferState::Confirmed;
            Ok(())
        })
    }

    async fn reopen_confirmed(&self, id: &[u8; 32]) -> RelayResult<()> {
        self.with_record(id, |record| {
            if record.state != TransferState::Confirmed {
                return Err(RelayError::InvalidStateTransition {
                    from: record.state.to_string(),
                    to: TransferState::Submitted.to_string(),
                });
            }
            record.state = TransferState::Submitted;
            Ok(())
        })
    }

    async fn due_for_submission(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> RelayResult<Vec<TransferRecord>> {
        let transfers = self.transfers.lock().unwrap();
        let mut due: Vec<TransferRecord> = transfers
            .values()
            .filter(|r| r.state == TransferState::Accepted && r.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|r| r.created_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn submitted_before(&self, cutoff: DateTime<Utc>) -> RelayResult<Vec<TransferRecord>> {
        let transfers = self.transfers.lock().unwrap();
        Ok(transfers
            .values()
            .filter(|r| r.state == TransferState::Submitted && r.updated_at <= cutoff)
            .cloned()
            .collect())
    }

    async fn stale_submitting(&self, cutoff: DateTime<Utc>) -> RelayResult<Vec<TransferRecord>> {
        let transfers = self.transfers.lock().unwrap();
        Ok(transfers
            .values()
            .filter(|r| r.state == TransferState::Submitting && r.updated_at <= cutoff)
            .cloned()
            .collect())
    }

    async fn confirmed_since(&self, cutoff: DateTime<Utc>) -> RelayResult<Vec<TransferRecord>> {
        let transfers = self.transfers.lock().unwrap();
        Ok(transfers
            .values()
            .filter(|r| r.state == TransferState::Confirmed && r.updated_at >= cutoff)
            .cloned()
            .collect())
    }

    async fn max_bound_nonce(&self, dest_chain: u64) -> RelayResult<Option<u64>> {
        let transfers = self.transfers.lock().unwrap();
        Ok(transfers
            .values()
            .filter(|r| {
                r.dest_chain == dest_chain
                    && matches!(
                        r.state,
                        TransferState::Submitting
                            | TransferState::Submitted
                            | TransferState::Confirmed
                    )
            })
            .filter_map(|r| r.nonce)
            .max())
    }

    async fn store_bid(&self, bid: &Bid) -> RelayResult<()> {
        self.bids.lock().unwrap().insert(bid.id, bid.clone());
        Ok(())
    }

    async fn stats(&self) -> RelayResult<TransferStats> {
        let transfers = self.transfers.lock().unwrap();
        let mut stats = TransferStats::default();
        for record in transfers.values() {
            match record.state {
                TransferState::Accepted => stats.accepted += 1,
                TransferState::Submitting => stats.submitting += 1,
                TransferState::Submitted => stats.submitted += 1,
                TransferState::Confirmed => stats.confirmed += 1,
                TransferState::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address, U256};

    fn record(id_byte: u8) -> TransferRecord {
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

    #[tokio::test]
    async fn insert_is_idempotent() {
        let ledger = MemoryLedger::new();
        let outcome = ledger.insert_accepted(record(1)).await.unwrap();
        assert!(matches!(outcome, InsertOutcome::Created(_)));

        let outcome = ledger.insert_accepted(record(1)).await.unwrap();
        assert!(matches!(outcome, InsertOutcome::Existing(_)));

        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.accepted, 1);
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let ledger = MemoryLedger::new();
        ledger.insert_accepted(record(1)).await.unwrap();

        let first = ledger
            .claim(&[1; 32], TransferState::Accepted, TransferState::Submitting)
            .await
            .unwrap();
        let second = ledger
            .claim(&[1; 32], TransferState::Accepted, TransferState::Submitting)
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn release_clears_binding_and_bumps_retries() {
        let ledger = MemoryLedger::new();
        ledger.insert_accepted(record(1)).await.unwrap();
        ledger
            .claim(&[1; 32], TransferState::Accepted, TransferState::Submitting)
            .await
            .unwrap();
        ledger.record_attempt(&[1; 32], 7).await.unwrap();

        ledger
            .release_submission(&[1; 32], Utc::now())
            .await
            .unwrap();

        let reopened = ledger.get(&[1; 32]).await.unwrap().unwrap();
        assert_eq!(reopened.state, TransferState::Accepted);
        assert_eq!(reopened.nonce, None);
        assert_eq!(reopened.tx_hash, None);
        assert_eq!(reopened.retry_count, 1);
    }

    #[tokio::test]
    async fn confirmed_requires_submitted() {
        let ledger = MemoryLedger::new();
        ledger.insert_accepted(record(1)).await.unwrap();

        // Straight from accepted must be rejected.
        assert!(ledger.mark_confirmed(&[1; 32]).await.is_err());

        ledger
            .claim(&[1; 32], TransferState::Accepted, TransferState::Submitting)
            .await
            .unwrap();
        ledger.record_attempt(&[1; 32], 0).await.unwrap();
        ledger
            .mark_submitted(&[1; 32], H256::repeat_byte(0xaa))
            .await
            .unwrap();
        ledger.mark_confirmed(&[1; 32]).await.unwrap();

        let confirmed = ledger.get(&[1; 32]).await.unwrap().unwrap();
        assert_eq!(confirmed.state, TransferState::Confirmed);
    }

    #[tokio::test]
    async fn max_bound_nonce_ignores_released_rows() {
        let ledger = MemoryLedger::new();
        for (id_byte, nonce) in [(1u8, 3u64), (2, 9), (3, 5)] {
            ledger.insert_accepted(record(id_byte)).await.unwrap();
            ledger
                .claim(
                    &[id_byte; 32],
                    TransferState::Accepted,
                    TransferState::Submitting,
                )
                .await
                .unwrap();
            ledger.record_attempt(&[id_byte; 32], nonce).await.unwrap();
        }
        // Nonce 9 was never broadcast and goes back to the pool.
        ledger
            .release_submission(&[2; 32], Utc::now())
            .await
            .unwrap();

        let max = ledger.max_bound_nonce(137).await.unwrap();
        assert_eq!(max, Some(5));
        assert_eq!(ledger.max_bound_nonce(1).await.unwrap(), None);
    }
}
