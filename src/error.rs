//! Error types for the chainferry relay node

use thiserror::Error;

/// Main error type for the relay node
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Gateway error for chain {chain_id}: {message}")]
    Gateway { chain_id: u64, message: String },

    #[error("Transaction rejected by chain {chain_id}: {message}")]
    TransactionRejected { chain_id: u64, message: String },

    #[error("Nonce error for chain {chain_id}: {message}")]
    Nonce { chain_id: u64, message: String },

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Transfer {request_id} not found")]
    TransferNotFound { request_id: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Insufficient balance on chain {chain_id}: have {have}, need {need}")]
    InsufficientBalance {
        chain_id: u64,
        have: String,
        need: String,
    },

    #[error("Rate limited on chain {chain_id}")]
    RateLimited { chain_id: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Transient infrastructure errors that are safe to retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::ChainConnection { .. }
                | RelayError::Gateway { .. }
                | RelayError::Timeout { .. }
                | RelayError::RateLimited { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayError::InsufficientBalance { .. }
                | RelayError::Signer(_)
                | RelayError::Database(_)
        )
    }
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
