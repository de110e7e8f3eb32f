//! Request validation: stateless checks that turn a signed transfer request
//! into an accepted ledger row
//!
//! Checks run in order and short-circuit on the first failure: signature,
//! referenced bid, duplicate request id, sender balance, request expiry.
//! Rejections are returned synchronously with a typed reason and persist
//! nothing; only a fully valid request creates a ledger row, atomically, in
//! `accepted`.

use crate::bids::BidRegistry;
use crate::chain::GatewayManager;
use crate::dispatch::{TaskDispatcher, WorkItem};
use crate::error::RelayResult;
use crate::ledger::{InsertOutcome, Ledger, TransferRecord, TransferState};
use crate::metrics;

use chrono::Utc;
use ethers::types::{Address, RecoveryMessage, Signature, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// A user-signed instruction to move tokens cross-chain, referencing a bid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedTransferRequest {
    pub source_chain: u64,
    pub dest_chain: u64,
    pub sender: Address,
    pub recipient: Address,
    pub token: Address,
    pub amount: U256,
    /// Referenced bid id as published by the bid registry.
    #[serde(with = "hex_bytes32")]
    pub bid_id: [u8; 32],
    /// Unix timestamp after which the sender no longer wants the transfer
    /// executed.
    pub deadline: u64,
    pub signature: Signature,
}

impl SignedTransferRequest {
    /// Canonical byte encoding covered by the sender's signature. The
    /// request id is the keccak256 of this payload, which makes duplicate
    /// submissions collapse onto one record.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(8 * 3 + 20 * 3 + 32 * 2);
        payload.extend_from_slice(&self.source_chain.to_be_bytes());
        payload.extend_from_slice(&self.dest_chain.to_be_bytes());
        payload.extend_from_slice(self.sender.as_bytes());
        payload.extend_from_slice(self.recipient.as_bytes());
        payload.extend_from_slice(self.token.as_bytes());
        let mut word = [0u8; 32];
        self.amount.to_big_endian(&mut word);
        payload.extend_from_slice(&word);
        payload.extend_from_slice(&self.bid_id);
        payload.extend_from_slice(&self.deadline.to_be_bytes());
        payload
    }

    pub fn digest(&self) -> H256 {
        H256::from(keccak256(self.signing_payload()))
    }

    /// Deterministic request id; doubles as the idempotency key.
    pub fn request_id(&self) -> [u8; 32] {
        self.digest().0
    }

    fn signature_matches_sender(&self) -> bool {
        self.signature
            .recover(RecoveryMessage::Hash(self.digest()))
            .map(|recovered| recovered == self.sender)
            .unwrap_or(false)
    }
}

/// Typed rejection reasons, reported to the caller and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectionReason {
    #[error("signature does not match sender")]
    InvalidSignature,
    #[error("referenced bid is unknown")]
    UnknownBid,
    #[error("referenced bid does not cover this chain pair and token")]
    BidMismatch,
    #[error("referenced bid has expired beyond its grace period")]
    BidExpired,
    #[error("amount exceeds the bid's maximum")]
    AmountExceedsBid,
    #[error("sender balance {have} does not cover amount plus fee {need}")]
    InsufficientBalance { have: String, need: String },
    #[error("request deadline has passed")]
    RequestExpired,
}

/// Outcome of validating one signed request.
#[derive(Debug, Clone)]
pub enum ValidationOutcome {
    /// The request is accepted (or was already known); the ledger record
    /// reflects its current lifecycle state.
    Accepted(TransferRecord),
    Rejected(RejectionReason),
}

pub struct RequestValidator {
    registry: Arc<BidRegistry>,
    ledger: Arc<dyn Ledger>,
    gateways: Arc<GatewayManager>,
    dispatcher: Arc<dyn TaskDispatcher>,
}

impl RequestValidator {
    pub fn new(
        registry: Arc<BidRegistry>,
        ledger: Arc<dyn Ledger>,
        gateways: Arc<GatewayManager>,
        dispatcher: Arc<dyn TaskDispatcher>,
    ) -> Self {
        Self {
            registry,
            ledger,
            gateways,
            dispatcher,
        }
    }

    /// Validate a signed request and, on success, insert it as `accepted`.
    ///
    /// Infrastructure failures (gateway or store unreachable) surface as
    /// errors so the caller can retry; they are never reported as
    /// rejections.
    pub async fn validate(
        &self,
        request: &SignedTransferRequest,
    ) -> RelayResult<ValidationOutcome> {
        let now = Utc::now();

        // (1) Signature
        if !request.signature_matches_sender() {
            metrics::record_request_rejected("invalid_signature");
            return Ok(ValidationOutcome::Rejected(RejectionReason::InvalidSignature));
        }

        // (2) Referenced bid
        let Some(bid) = self.registry.bid_by_id(&request.bid_id) else {
            metrics::record_request_rejected("unknown_bid");
            return Ok(ValidationOutcome::Rejected(RejectionReason::UnknownBid));
        };
        if bid.source_chain != request.source_chain
            || bid.dest_chain != request.dest_chain
            || bid.token != request.token
        {
            metrics::record_request_rejected("bid_mismatch");
            return Ok(ValidationOutcome::Rejected(RejectionReason::BidMismatch));
        }
        if !bid.within_grace(now, self.registry.grace()) {
            metrics::record_request_rejected("bid_expired");
            return Ok(ValidationOutcome::Rejected(RejectionReason::BidExpired));
        }
        if request.amount > bid.max_amount {
            metrics::record_request_rejected("amount_exceeds_bid");
            return Ok(ValidationOutcome::Rejected(RejectionReason::AmountExceedsBid));
        }

        // (3) Duplicate request id: idempotent accept, no re-validation.
        let request_id = request.request_id();
        if let Some(existing) = self.ledger.get(&request_id).await? {
            debug!(
                "Duplicate request {} in state {}",
                existing.request_id_hex(),
                existing.state
            );
            return Ok(ValidationOutcome::Accepted(existing));
        }

        // (4) Sender balance on the source chain covers amount + fee.
        let gateway = self.gateways.get(request.source_chain)?;
        let balance = gateway.get_balance(request.sender, request.token).await?;
        let need = request.amount + bid.fee;
        if balance < need {
            metrics::record_request_rejected("insufficient_balance");
            return Ok(ValidationOutcome::Rejected(
                RejectionReason::InsufficientBalance {
                    have: balance.to_string(),
                    need: need.to_string(),
                },
            ));
        }

        // (5) Request expiry
        if now.timestamp() > request.deadline as i64 {
            metrics::record_request_rejected("request_expired");
            return Ok(ValidationOutcome::Rejected(RejectionReason::RequestExpired));
        }

        let record = TransferRecord {
            id: request_id,
            source_chain: request.source_chain,
            dest_chain: request.dest_chain,
            sender: request.sender,
            recipient: request.recipient,
            token: request.token,
            amount: request.amount,
            fee: bid.fee,
            bid_id: request.bid_id,
            nonce: None,
            tx_hash: None,
            state: TransferState::Accepted,
            retry_count: 0,
            next_attempt_at: now,
            created_at: now,
            updated_at: now,
        };

        let outcome = self.ledger.insert_accepted(record).await?;
        let stored = outcome.record().clone();

        if matches!(outcome, InsertOutcome::Created(_)) {
            info!(
                "Accepted transfer {} ({} -> {}, amount {})",
                stored.request_id_hex(),
                stored.source_chain,
                stored.dest_chain,
                stored.amount
            );
            metrics::record_request_accepted(stored.source_chain, stored.dest_chain);

            // Workers also scan the ledger, so a full queue delays but never
            // loses the transfer.
            if let Err(e) = self
                .dispatcher
                .enqueue(WorkItem::SubmitTransfer(request_id))
                .await
            {
                warn!("Failed to enqueue transfer {}: {}", hex::encode(request_id), e);
            }
        }

        Ok(ValidationOutcome::Accepted(stored))
    }
}

/// Serde helper for 32-byte ids as 0x-prefixed hex strings.
mod hex_bytes32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let stripped = s.strip_prefix("0x").unwrap_or(&s);
        let bytes = hex::decode(stripped).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}
