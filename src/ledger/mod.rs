//! Transfer ledger: the durable record of every accepted transfer and the
//! single source of truth for recovery
//!
//! The ledger is the one shared mutable resource between the validator, the
//! submission workers, and the confirmation poller. All multi-worker
//! coordination happens through `claim`, a compare-and-set state transition,
//! so exactly one worker advances a given transfer at a time.

#[cfg(test)]
mod memory;
mod postgres;

#[cfg(test)]
pub use memory::MemoryLedger;
pub use postgres::PgLedger;

use crate::bids::Bid;
use crate::error::{RelayError, RelayResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use std::fmt;

/// Lifecycle state of a transfer.
///
/// `Accepted → Submitting → Submitted → {Confirmed | Failed}`, with
/// `Submitting → Accepted` on a pre-broadcast retry, `Submitted → Accepted`
/// on a revert or dropped transaction, and `Confirmed → Submitted` when a
/// reorg removes a previously confirmed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Accepted,
    Submitting,
    Submitted,
    Confirmed,
    Failed,
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Accepted => "accepted",
            TransferState::Submitting => "submitting",
            TransferState::Submitted => "submitted",
            TransferState::Confirmed => "confirmed",
            TransferState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> RelayResult<Self> {
        match s {
            "accepted" => Ok(TransferState::Accepted),
            "submitting" => Ok(TransferState::Submitting),
            "submitted" => Ok(TransferState::Submitted),
            "confirmed" => Ok(TransferState::Confirmed),
            "failed" => Ok(TransferState::Failed),
            other => Err(RelayError::Internal(format!(
                "Unknown transfer state: {}",
                other
            ))),
        }
    }

    /// Terminal states are never claimed or reopened by the pipeline. A
    /// `confirmed` transfer can still be reopened by the poller within the
    /// reconfirmation window.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Confirmed | TransferState::Failed)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One accepted transfer request and its lifecycle bookkeeping.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    /// Deterministic idempotency key: keccak256 of the canonical signing
    /// payload of the request.
    pub id: [u8; 32],
    pub source_chain: u64,
    pub dest_chain: u64,
    pub sender: Address,
    pub recipient: Address,
    pub token: Address,
    pub amount: U256,
    /// Relay fee from the referenced bid, snapshotted at acceptance.
    pub fee: U256,
    pub bid_id: [u8; 32],
    /// Destination-chain nonce, bound while a submission attempt is live.
    pub nonce: Option<u64>,
    pub tx_hash: Option<H256>,
    pub state: TransferState,
    pub retry_count: u32,
    /// Earliest time the next submission attempt may run (backoff).
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    pub fn request_id_hex(&self) -> String {
        hex::encode(self.id)
    }
}

/// Result of an idempotent insert.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Created(TransferRecord),
    /// The request id was already known; the existing record is returned
    /// unchanged.
    Existing(TransferRecord),
}

impl InsertOutcome {
    pub fn record(&self) -> &TransferRecord {
        match self {
            InsertOutcome::Created(r) | InsertOutcome::Existing(r) => r,
        }
    }
}

/// Per-state row counts, for `/stats` and metrics.
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    pub accepted: u64,
    pub submitting: u64,
    pub submitted: u64,
    pub confirmed: u64,
    pub failed: u64,
}

/// Durable transfer store.
///
/// Implementations must make `insert_accepted` and `claim` atomic; those two
/// operations carry the idempotency and exclusivity guarantees of the whole
/// pipeline.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Insert a new transfer in `accepted`, or return the existing record if
    /// the id is already known. Never overwrites.
    async fn insert_accepted(&self, record: TransferRecord) -> RelayResult<InsertOutcome>;

    async fn get(&self, id: &[u8; 32]) -> RelayResult<Option<TransferRecord>>;

    /// Compare-and-set state transition. Returns true if the row was in
    /// `from` and is now in `to`; false if another worker got there first.
    async fn claim(
        &self,
        id: &[u8; 32],
        from: TransferState,
        to: TransferState,
    ) -> RelayResult<bool>;

    /// Persist the nonce bound to the live submission attempt.
    async fn record_attempt(&self, id: &[u8; 32], nonce: u64) -> RelayResult<()>;

    /// `submitting → submitted`, recording the broadcast transaction hash.
    /// The nonce is permanently bound from this point.
    async fn mark_submitted(&self, id: &[u8; 32], tx_hash: H256) -> RelayResult<()>;

    /// Return a transfer to `accepted` for another attempt: clears the nonce
    /// binding and transaction hash, increments the retry count, and
    /// schedules the next attempt.
    async fn release_submission(
        &self,
        id: &[u8; 32],
        next_attempt_at: DateTime<Utc>,
    ) -> RelayResult<()>;

    /// Terminal failure.
    async fn mark_failed(&self, id: &[u8; 32]) -> RelayResult<()>;

    /// `submitted → confirmed`.
    async fn mark_confirmed(&self, id: &[u8; 32]) -> RelayResult<()>;

    /// `confirmed → submitted`: a reorg dropped the confirming block, so the
    /// transfer goes back to being polled.
    async fn reopen_confirmed(&self, id: &[u8; 32]) -> RelayResult<()>;

    /// `accepted` rows whose backoff has elapsed, oldest first.
    async fn due_for_submission(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> RelayResult<Vec<TransferRecord>>;

    /// `submitted` rows last updated before the cutoff.
    async fn submitted_before(&self, cutoff: DateTime<Utc>) -> RelayResult<Vec<TransferRecord>>;

    /// `submitting` rows last updated before the cutoff: abandoned by a
    /// crashed worker, subject to the recovery sweep.
    async fn stale_submitting(&self, cutoff: DateTime<Utc>) -> RelayResult<Vec<TransferRecord>>;

    /// `confirmed` rows updated since the cutoff, still inside the
    /// reorg re-check window.
    async fn confirmed_since(&self, cutoff: DateTime<Utc>) -> RelayResult<Vec<TransferRecord>>;

    /// Highest nonce bound to a `submitting`/`submitted`/`confirmed` transfer
    /// on a destination chain. Used to reconcile the nonce sequencer after a
    /// restart.
    async fn max_bound_nonce(&self, dest_chain: u64) -> RelayResult<Option<u64>>;

    /// Persist a freshly signed bid (bids are immutable once signed).
    async fn store_bid(&self, bid: &Bid) -> RelayResult<()>;

    async fn stats(&self) -> RelayResult<TransferStats>;
}
