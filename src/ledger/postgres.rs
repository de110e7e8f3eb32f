//! PostgreSQL ledger
//!
//! Amounts are stored as NUMERIC(78) (large enough for a 256-bit unsigned
//! integer) and travel through text casts. The compare-and-set claim is a
//! single conditional UPDATE; row-level locking in Postgres makes it atomic
//! across concurrent workers.

use super::{InsertOutcome, Ledger, TransferRecord, TransferState, TransferStats};
use crate::bids::Bid;
use crate::config::DatabaseConfig;
use crate::error::{RelayError, RelayResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::info;

pub struct PgLedger {
    pool: PgPool,
}

const TRANSFER_COLUMNS: &str = "id, source_chain, dest_chain, sender, recipient, token, \
     amount::TEXT AS amount, fee::TEXT AS fee, bid_id, nonce, tx_hash, state, \
     retry_count, next_attempt_at, created_at, updated_at";

impl PgLedger {
    pub async fn new(config: &DatabaseConfig) -> RelayResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(RelayError::Database)?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> RelayResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                id BYTEA PRIMARY KEY,
                source_chain BIGINT NOT NULL,
                dest_chain BIGINT NOT NULL,
                sender VARCHAR(42) NOT NULL,
                recipient VARCHAR(42) NOT NULL,
                token VARCHAR(42) NOT NULL,
                amount NUMERIC(78, 0) NOT NULL,
                fee NUMERIC(78, 0) NOT NULL,
                bid_id BYTEA NOT NULL,
                nonce BIGINT,
                tx_hash VARCHAR(66),
                state VARCHAR(16) NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_attempt_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT unique_dest_chain_nonce UNIQUE (dest_chain, nonce)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transfers_state_next_attempt
            ON transfers (state, next_attempt_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bids (
                id BYTEA PRIMARY KEY,
                source_chain BIGINT NOT NULL,
                dest_chain BIGINT NOT NULL,
                token VARCHAR(42) NOT NULL,
                fee NUMERIC(78, 0) NOT NULL,
                max_amount NUMERIC(78, 0) NOT NULL,
                valid_from TIMESTAMPTZ NOT NULL,
                valid_until TIMESTAMPTZ NOT NULL,
                signature VARCHAR(132) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> RelayResult<TransferRecord> {
        let id_bytes: Vec<u8> = row.get("id");
        let bid_bytes: Vec<u8> = row.get("bid_id");
        let tx_hash: Option<String> = row.get("tx_hash");
        let nonce: Option<i64> = row.get("nonce");
        let state: String = row.get("state");

        Ok(TransferRecord {
            id: bytes32(&id_bytes)?,
            source_chain: row.get::<i64, _>("source_chain") as u64,
            dest_chain: row.get::<i64, _>("dest_chain") as u64,
            sender: parse_address(row.get("sender"))?,
            recipient: parse_address(row.get("recipient"))?,
            token: parse_address(row.get("token"))?,
            amount: parse_amount(row.get("amount"))?,
            fee: parse_amount(row.get("fee"))?,
            bid_id: bytes32(&bid_bytes)?,
            nonce: nonce.map(|n| n as u64),
            tx_hash: tx_hash.as_deref().map(parse_hash).transpose()?,
            state: TransferState::parse(&state)?,
            retry_count: row.get::<i32, _>("retry_count") as u32,
            next_attempt_at: row.get("next_attempt_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn insert_accepted(&self, record: TransferRecord) -> RelayResult<InsertOutcome> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO transfers
                (id, source_chain, dest_chain, sender, recipient, token,
                 amount, fee, bid_id, state, retry_count, next_attempt_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7::NUMERIC, $8::NUMERIC, $9, $10, 0, NOW())
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&record.id[..])
        .bind(record.source_chain as i64)
        .bind(record.dest_chain as i64)
        .bind(format!("{:?}", record.sender))
        .bind(format!("{:?}", record.recipient))
        .bind(format!("{:?}", record.token))
        .bind(record.amount.to_string())
        .bind(record.fee.to_string())
        .bind(&record.bid_id[..])
        .bind(TransferState::Accepted.as_str())
        .execute(&self.pool)
        .await?;

        // A concurrent duplicate loses the insert race and reads the winner.
        let stored = self
            .get(&record.id)
            .await?
            .ok_or_else(|| RelayError::TransferNotFound {
                request_id: hex::encode(record.id),
            })?;

        if inserted.rows_affected() == 1 {
            Ok(InsertOutcome::Created(stored))
        } else {
            Ok(InsertOutcome::Existing(stored))
        }
    }

    async fn get(&self, id: &[u8; 32]) -> RelayResult<Option<TransferRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transfers WHERE id = $1",
            TRANSFER_COLUMNS
        ))
        .bind(&id[..])
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn claim(
        &self,
        id: &[u8; 32],
        from: TransferState,
        to: TransferState,
    ) -> RelayResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET state = $1, updated_at = NOW()
            WHERE id = $2 AND state = $3
            "#,
        )
        .bind(to.as_str())
        .bind(&id[..])
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_attempt(&self, id: &[u8; 32], nonce: u64) -> RelayResult<()> {
        sqlx::query(
            r#"
            UPDATE transfers
            SET nonce = $1, updated_at = NOW()
            WHERE id = $2 AND state = 'submitting'
            "#,
        )
        .bind(nonce as i64)
        .bind(&id[..])
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_submitted(&self, id: &[u8; 32], tx_hash: H256) -> RelayResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET state = 'submitted', tx_hash = $1, updated_at = NOW()
            WHERE id = $2 AND state = 'submitting'
            "#,
        )
        .bind(format!("{:?}", tx_hash))
        .bind(&id[..])
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(RelayError::InvalidStateTransition {
                from: "unknown".to_string(),
                to: TransferState::Submitted.to_string(),
            });
        }
        Ok(())
    }

    async fn release_submission(
        &self,
        id: &[u8; 32],
        next_attempt_at: DateTime<Utc>,
    ) -> RelayResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET state = 'accepted', nonce = NULL, tx_hash = NULL,
                retry_count = retry_count + 1, next_attempt_at = $1,
                updated_at = NOW()
            WHERE id = $2 AND state IN ('submitting', 'submitted')
            "#,
        )
        .bind(next_attempt_at)
        .bind(&id[..])
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(RelayError::InvalidStateTransition {
                from: "unknown".to_string(),
                to: TransferState::Accepted.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_failed(&self, id: &[u8; 32]) -> RelayResult<()> {
        sqlx::query(
            r#"
            UPDATE transfers
            SET state = 'failed', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(&id[..])
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_confirmed(&self, id: &[u8; 32]) -> RelayResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET state = 'confirmed', updated_at = NOW()
            WHERE id = $1 AND state = 'submitted'
            "#,
        )
        .bind(&id[..])
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(RelayError::InvalidStateTransition {
                from: "unknown".to_string(),
                to: TransferState::Confirmed.to_string(),
            });
        }
        Ok(())
    }

    async fn reopen_confirmed(&self, id: &[u8; 32]) -> RelayResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET state = 'submitted', updated_at = NOW()
            WHERE id = $1 AND state = 'confirmed'
            "#,
        )
        .bind(&id[..])
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(RelayError::InvalidStateTransition {
                from: "unknown".to_string(),
                to: TransferState::Submitted.to_string(),
            });
        }
        Ok(())
    }

    async fn due_for_submission(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> RelayResult<Vec<TransferRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM transfers
            WHERE state = 'accepted' AND next_attempt_at <= $1
            ORDER BY created_at
            LIMIT $2
            "#,
            TRANSFER_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn submitted_before(&self, cutoff: DateTime<Utc>) -> RelayResult<Vec<TransferRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM transfers
            WHERE state = 'submitted' AND updated_at <= $1
            ORDER BY updated_at
            "#,
            TRANSFER_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn stale_submitting(&self, cutoff: DateTime<Utc>) -> RelayResult<Vec<TransferRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM transfers
            WHERE state = 'submitting' AND updated_at <= $1
            "#,
            TRANSFER_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn confirmed_since(&self, cutoff: DateTime<Utc>) -> RelayResult<Vec<TransferRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM transfers
            WHERE state = 'confirmed' AND updated_at >= $1
            "#,
            TRANSFER_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn max_bound_nonce(&self, dest_chain: u64) -> RelayResult<Option<u64>> {
        let row = sqlx::query(
            r#"
            SELECT MAX(nonce) AS max_nonce FROM transfers
            WHERE dest_chain = $1
              AND nonce IS NOT NULL
              AND state IN ('submitting', 'submitted', 'confirmed')
            "#,
        )
        .bind(dest_chain as i64)
        .fetch_one(&self.pool)
        .await?;

        let max_nonce: Option<i64> = row.get("max_nonce");
        Ok(max_nonce.map(|n| n as u64))
    }

    async fn store_bid(&self, bid: &Bid) -> RelayResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bids
                (id, source_chain, dest_chain, token, fee, max_amount,
                 valid_from, valid_until, signature)
            VALUES ($1, $2, $3, $4, $5::NUMERIC, $6::NUMERIC, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&bid.id[..])
        .bind(bid.source_chain as i64)
        .bind(bid.dest_chain as i64)
        .bind(format!("{:?}", bid.token))
        .bind(bid.fee.to_string())
        .bind(bid.max_amount.to_string())
        .bind(bid.valid_from)
        .bind(bid.valid_until)
        .bind(format!("0x{}", bid.signature))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stats(&self) -> RelayResult<TransferStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'accepted') as accepted,
                COUNT(*) FILTER (WHERE state = 'submitting') as submitting,
                COUNT(*) FILTER (WHERE state = 'submitted') as submitted,
                COUNT(*) FILTER (WHERE state = 'confirmed') as confirmed,
                COUNT(*) FILTER (WHERE state = 'failed') as failed
            FROM transfers
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(TransferStats {
            accepted: row.get::<i64, _>("accepted") as u64,
            submitting: row.get::<i64, _>("submitting") as u64,
            submitted: row.get::<i64, _>("submitted") as u64,
            confirmed: row.get::<i64, _>("confirmed") as u64,
            failed: row.get::<i64, _>("failed") as u64,
        })
    }
}

fn bytes32(bytes: &[u8]) -> RelayResult<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| RelayError::Internal(format!("Expected 32 bytes, got {}", bytes.len())))
}

fn parse_address(s: String) -> RelayResult<Address> {
    s.parse::<Address>()
        .map_err(|e| RelayError::Internal(format!("Invalid stored address {}: {}", s, e)))
}

fn parse_hash(s: &str) -> RelayResult<H256> {
    s.parse::<H256>()
        .map_err(|e| RelayError::Internal(format!("Invalid stored tx hash {}: {}", s, e)))
}

fn parse_amount(s: String) -> RelayResult<U256> {
    U256::from_dec_str(&s)
        .map_err(|e| RelayError::Internal(format!("Invalid stored amount {}: {}", s, e)))
}
