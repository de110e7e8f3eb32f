//! Chain gateway contract: the narrow RPC surface the lifecycle engine
//! depends on per chain. Everything behind this trait is an unreliable
//! network dependency and is wrapped with timeouts and failover.

use crate::error::RelayResult;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};

/// Outcome of a receipt lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiptLookup {
    /// The transaction is not known to the chain (not yet mined, dropped,
    /// or reorged out).
    NotFound,
    /// The transaction is included in a block.
    Mined {
        status: TxStatus,
        block_number: u64,
        confirmations: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Success,
    Reverted,
}

/// The relay transaction to execute on the destination chain.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferTransaction {
    pub chain_id: u64,
    /// Idempotency key of the transfer, forwarded on-chain so the ferry
    /// contract can reject duplicates.
    pub transfer_id: [u8; 32],
    pub token: Address,
    pub recipient: Address,
    pub amount: U256,
    pub nonce: u64,
}

/// Per-chain adapter for balance/nonce queries, transaction submission, and
/// receipt lookup.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainGateway: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Current on-chain transaction count for an account.
    async fn get_nonce(&self, account: Address) -> RelayResult<u64>;

    /// Token balance of an account.
    async fn get_balance(&self, account: Address, token: Address) -> RelayResult<U256>;

    /// Sign and broadcast a relay transaction, returning its hash.
    async fn submit_transaction(&self, tx: &TransferTransaction) -> RelayResult<H256>;

    /// Look up the receipt of a previously submitted transaction.
    async fn get_receipt(&self, tx_hash: H256) -> RelayResult<ReceiptLookup>;

    /// Current chain head.
    async fn block_number(&self) -> RelayResult<u64>;
}
