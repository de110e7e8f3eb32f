//! EVM chain gateway over ethers with multi-RPC failover
//!
//! Every RPC call is bounded by the per-chain timeout; a failed call rotates
//! to the next configured provider before giving up.

use super::gateway::{ChainGateway, ReceiptLookup, TransferTransaction, TxStatus};
use crate::config::ChainConfig;
use crate::error::{RelayError, RelayResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::keccak256;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Gas limit for a ferry release call. The call is a fixed-shape token
/// transfer out of escrow, so a static limit is sufficient.
const RELEASE_GAS_LIMIT: u64 = 200_000;

/// Gateway to one EVM chain.
pub struct EvmGateway {
    config: ChainConfig,
    providers: Vec<Provider<Http>>,
    current_provider: AtomicUsize,
    wallet: LocalWallet,
    ferry_address: Address,
}

impl EvmGateway {
    pub fn new(config: ChainConfig, wallet: LocalWallet) -> RelayResult<Self> {
        let mut providers = Vec::new();
        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    providers.push(provider.interval(Duration::from_millis(100)));
                    debug!("Added RPC provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if providers.is_empty() {
            return Err(RelayError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        let ferry_address: Address = config.ferry_address.parse().map_err(|e| {
            RelayError::Config(format!(
                "Invalid ferry address for chain {}: {}",
                config.chain_id, e
            ))
        })?;

        let wallet = wallet.with_chain_id(config.chain_id);
        info!(
            "Chain {} gateway ready ({} providers, ferry {:?})",
            config.chain_id,
            providers.len(),
            ferry_address
        );

        Ok(Self {
            config,
            providers,
            current_provider: AtomicUsize::new(0),
            wallet,
            ferry_address,
        })
    }

    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.providers[idx % self.providers.len()]
    }

    /// Switch to the next available provider.
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.config.rpc_timeout_secs)
    }

    fn gateway_error(&self, message: impl Into<String>) -> RelayError {
        RelayError::Gateway {
            chain_id: self.config.chain_id,
            message: message.into(),
        }
    }

    /// Run an RPC call against each provider in turn until one succeeds.
    async fn with_failover<T, F, Fut>(&self, operation: &str, call: F) -> RelayResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        for _ in 0..self.providers.len() {
            let provider = self.http().clone();
            match timeout(self.rpc_timeout(), call(provider)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    warn!(
                        "Chain {} {} failed: {}",
                        self.config.chain_id, operation, e
                    );
                    self.failover();
                }
                Err(_) => {
                    warn!("Chain {} {} timed out", self.config.chain_id, operation);
                    self.failover();
                }
            }
        }

        Err(self.gateway_error(format!("All providers failed for {}", operation)))
    }

    /// Map a node's send error onto the retry taxonomy.
    fn classify_send_error(&self, message: String) -> RelayError {
        if message.contains("nonce too low") || message.contains("already known") {
            // The chain already holds or consumed this nonce; the caller
            // must not return the slot to its local pool.
            RelayError::Nonce {
                chain_id: self.config.chain_id,
                message,
            }
        } else if message.contains("insufficient funds") {
            // The node examined the transaction and refused it; retrying
            // the same bytes cannot succeed.
            RelayError::TransactionRejected {
                chain_id: self.config.chain_id,
                message,
            }
        } else if message.contains("rate limit") || message.contains("too many requests") {
            self.failover();
            RelayError::RateLimited {
                chain_id: self.config.chain_id,
            }
        } else {
            self.failover();
            self.gateway_error(message)
        }
    }

    /// Calldata for `releaseTransfer(bytes32,address,address,uint256)`.
    fn release_calldata(tx: &TransferTransaction) -> Vec<u8> {
        let selector =
            &keccak256(b"releaseTransfer(bytes32,address,address,uint256)")[..4];
        let mut data = Vec::with_capacity(4 + 32 * 4);
        data.extend_from_slice(selector);
        data.extend_from_slice(&tx.transfer_id);
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(tx.token.as_bytes());
        data.extend_from_slice(&word);
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(tx.recipient.as_bytes());
        data.extend_from_slice(&word);
        let mut word = [0u8; 32];
        tx.amount.to_big_endian(&mut word);
        data.extend_from_slice(&word);
        data
    }

    /// Calldata for `balanceOf(address)`.
    fn balance_calldata(account: Address) -> Vec<u8> {
        let selector = &keccak256(b"balanceOf(address)")[..4];
        let mut data = Vec::with_capacity(4 + 32);
        data.extend_from_slice(selector);
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(account.as_bytes());
        data.extend_from_slice(&word);
        data
    }
}

#[async_trait]
impl ChainGateway for EvmGateway {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    async fn get_nonce(&self, account: Address) -> RelayResult<u64> {
        let nonce = self
            .with_failover("get_transaction_count", |p| async move {
                p.get_transaction_count(account, None).await
            })
            .await?;
        Ok(nonce.as_u64())
    }

    async fn get_balance(&self, account: Address, token: Address) -> RelayResult<U256> {
        let calldata = Self::balance_calldata(account);
        let raw = self
            .with_failover("balance_of", |p| {
                let calldata = calldata.clone();
                async move {
                    let call_tx: TypedTransaction = TransactionRequest::new()
                        .to(token)
                        .data(calldata)
                        .into();
                    p.call(&call_tx, None).await
                }
            })
            .await?;

        if raw.len() < 32 {
            return Err(self.gateway_error("Malformed balanceOf response"));
        }
        Ok(U256::from_big_endian(&raw[..32]))
    }

    async fn submit_transaction(&self, tx: &TransferTransaction) -> RelayResult<H256> {
        let gas_price = self
            .with_failover("gas_price", |p| async move { p.get_gas_price().await })
            .await?;

        let request = TransactionRequest::new()
            .to(self.ferry_address)
            .data(Self::release_calldata(tx))
            .nonce(tx.nonce)
            .gas(RELEASE_GAS_LIMIT)
            .gas_price(gas_price);
        let typed: TypedTransaction = request.into();

        let signature = self
            .wallet
            .sign_transaction(&typed)
            .await
            .map_err(|e| RelayError::Signer(e.to_string()))?;
        let raw = typed.rlp_signed(&signature);

        let provider = self.http().clone();
        let result = timeout(self.rpc_timeout(), provider.send_raw_transaction(raw)).await;

        match result {
            Ok(Ok(pending)) => {
                let tx_hash = pending.tx_hash();
                debug!(
                    "Chain {} broadcast nonce {} as {:?}",
                    self.config.chain_id, tx.nonce, tx_hash
                );
                Ok(tx_hash)
            }
            Ok(Err(e)) => Err(self.classify_send_error(e.to_string())),
            Err(_) => {
                self.failover();
                Err(RelayError::Timeout {
                    operation: format!("send transaction on chain {}", self.config.chain_id),
                })
            }
        }
    }

    async fn get_receipt(&self, tx_hash: H256) -> RelayResult<ReceiptLookup> {
        let receipt = self
            .with_failover("get_transaction_receipt", |p| async move {
                p.get_transaction_receipt(tx_hash).await
            })
            .await?;

        let Some(receipt) = receipt else {
            return Ok(ReceiptLookup::NotFound);
        };
        let Some(block_number) = receipt.block_number else {
            return Ok(ReceiptLookup::NotFound);
        };

        let head = self.block_number().await?;
        let block_number = block_number.as_u64();
        let status = if receipt.status == Some(1.into()) {
            TxStatus::Success
        } else {
            TxStatus::Reverted
        };

        Ok(ReceiptLookup::Mined {
            status,
            block_number,
            confirmations: head.saturating_sub(block_number) + 1,
        })
    }

    async fn block_number(&self) -> RelayResult<u64> {
        let block = self
            .with_failover("get_block_number", |p| async move {
                p.get_block_number().await
            })
            .await?;
        Ok(block.as_u64())
    }
}
