//! Chain gateways: per-chain RPC adapters and their registry

mod evm;
mod gateway;

pub use evm::EvmGateway;
pub use gateway::{ChainGateway, ReceiptLookup, TransferTransaction, TxStatus};

#[cfg(test)]
pub use gateway::MockChainGateway;

use crate::config::Settings;
use crate::error::{RelayError, RelayResult};

use dashmap::DashMap;
use ethers::signers::LocalWallet;
use std::sync::Arc;

/// Registry of one gateway per enabled chain.
pub struct GatewayManager {
    gateways: DashMap<u64, Arc<dyn ChainGateway>>,
}

impl GatewayManager {
    /// Build gateways for all enabled chains.
    pub fn new(settings: &Settings, wallet: LocalWallet) -> RelayResult<Self> {
        let gateways: DashMap<u64, Arc<dyn ChainGateway>> = DashMap::new();

        for (_, chain_config) in settings.enabled_chains() {
            let gateway = EvmGateway::new(chain_config.clone(), wallet.clone())?;
            gateways.insert(chain_config.chain_id, Arc::new(gateway));
        }

        Ok(Self { gateways })
    }

    /// Registry over externally constructed gateways. Used by tests and by
    /// alternative gateway implementations.
    pub fn from_gateways(list: Vec<Arc<dyn ChainGateway>>) -> Self {
        let gateways = DashMap::new();
        for gateway in list {
            gateways.insert(gateway.chain_id(), gateway);
        }
        Self { gateways }
    }

    pub fn get(&self, chain_id: u64) -> RelayResult<Arc<dyn ChainGateway>> {
        self.gateways
            .get(&chain_id)
            .map(|entry| entry.value().clone())
            .ok_or(RelayError::ChainNotFound { chain_id })
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        self.gateways.iter().map(|entry| *entry.key()).collect()
    }

    /// Probe each chain head once; used by the health loop and `/ready`.
    /// Gateways are snapshotted first so no map guard is held across an
    /// RPC await.
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let gateways: Vec<(u64, Arc<dyn ChainGateway>)> = self
            .gateways
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut results = Vec::with_capacity(gateways.len());
        for (chain_id, gateway) in gateways {
            let healthy = gateway.block_number().await.is_ok();
            results.push((chain_id, healthy));
        }
        results
    }
}
