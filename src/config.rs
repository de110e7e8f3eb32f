//! Configuration management for the chainferry relay node
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relay: RelayConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
    pub wallet: WalletConfig,
    pub bids: BidConfig,
}

/// Pipeline, poller, and recovery tuning.
///
/// Confirmation depth lives on the per-chain config; everything else that the
/// lifecycle engine treats as policy is configurable here rather than
/// hard-coded.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub instance_id: String,
    /// Number of concurrent submission workers.
    pub worker_count: usize,
    /// How often each worker scans for due `accepted` rows.
    pub poll_interval_ms: u64,
    /// Maximum submission attempts per transfer before terminal failure.
    pub max_retries: u32,
    /// Base delay of the exponential backoff schedule.
    pub retry_base_delay_ms: u64,
    /// Cap on the exponential backoff schedule.
    pub retry_max_delay_ms: u64,
    /// Age after which a `submitting` row is treated as abandoned.
    pub submitting_grace_secs: u64,
    /// How often the confirmation poller scans `submitted` rows.
    pub confirmation_poll_interval_secs: u64,
    /// Minimum age of a `submitted` row before its receipt is queried.
    pub min_confirmation_delay_secs: u64,
    /// How long a missing receipt is tolerated before the transfer is
    /// reopened for resubmission.
    pub receipt_timeout_secs: u64,
    /// How long `confirmed` rows keep being re-checked for reorgs.
    pub reconfirm_window_secs: u64,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    /// Address of the ferry escrow contract that releases transfers on this
    /// chain.
    pub ferry_address: String,
    /// Confirmation depth required before a transfer is final on this chain.
    pub confirmation_blocks: u64,
    pub rpc_timeout_secs: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub private_key_env: Option<String>,
}

/// Bid registry configuration: refresh cadence, validity policy, and the
/// (source, destination, token) routes this node prices.
#[derive(Debug, Clone, Deserialize)]
pub struct BidConfig {
    pub refresh_interval_secs: u64,
    /// Validity window stamped on each freshly signed bid.
    pub validity_secs: u64,
    /// Grace period during which a superseded or just-expired bid is still
    /// honored for requests that reference it.
    pub grace_secs: u64,
    pub routes: Vec<BidRoute>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BidRoute {
    pub source_chain: u64,
    pub dest_chain: u64,
    /// Token contract address on the source chain.
    pub token: String,
    /// Flat relay fee for this route, in the token's smallest unit.
    pub fee: String,
    /// Largest amount a single transfer on this route may carry.
    pub max_amount: String,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("CHAINFERRY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        // At least one chain must be enabled
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in &self.chains {
            if chain.enabled && chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
        }

        if self.relay.worker_count == 0 {
            anyhow::bail!("relay.worker_count must be at least 1");
        }
        if self.relay.max_retries == 0 {
            anyhow::bail!("relay.max_retries must be at least 1");
        }

        // Every bid route must reference enabled chains
        for route in &self.bids.routes {
            for chain_id in [route.source_chain, route.dest_chain] {
                if self.get_chain_by_id(chain_id).is_none() {
                    anyhow::bail!("Bid route references unknown chain {}", chain_id);
                }
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains
            .values()
            .find(|c| c.chain_id == chain_id && c.enabled)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
