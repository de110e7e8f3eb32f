//! Chainferry - cross-chain token transfer relay node
//!
//! Issues signed fee bids, validates signed transfer requests against them,
//! and drives each accepted transfer through submission and confirmation on
//! the destination chain, with a durable ledger as the single source of
//! truth for recovery.

use anyhow::{Context, Result};
use ethers::signers::{LocalWallet, Signer};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod bids;
mod chain;
mod config;
mod dispatch;
mod error;
mod ledger;
mod metrics;
mod nonce;
mod pipeline;
mod poller;
mod validate;

use bids::{BidRegistry, ConfiguredFeePolicy, WalletBidSigner};
use chain::GatewayManager;
use config::Settings;
use dispatch::QueueDispatcher;
use ledger::{Ledger, PgLedger};
use metrics::MetricsServer;
use nonce::NonceSequencer;
use pipeline::SubmissionPipeline;
use poller::ConfirmationPoller;
use validate::RequestValidator;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting chainferry v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let wallet = load_wallet(&settings)?;
    info!("Relay account: {:?}", wallet.address());

    let pg = PgLedger::new(&settings.database).await?;
    pg.run_migrations().await?;
    let ledger: Arc<dyn Ledger> = Arc::new(pg);

    let gateways = Arc::new(GatewayManager::new(&settings, wallet.clone())?);
    info!("Chain gateways initialized");

    // Bid registry with an initial refresh so intake can start immediately.
    let policy = Arc::new(ConfiguredFeePolicy::from_routes(&settings.bids.routes)?);
    let signer = Arc::new(WalletBidSigner::new(wallet.clone()));
    let registry = Arc::new(BidRegistry::new(&settings.bids, policy, signer)?);
    let refreshed = registry.refresh();
    metrics::record_bids_refreshed(refreshed);
    persist_bids(&registry, &ledger).await;
    info!("Published {} initial bids", refreshed);

    let sequencer = Arc::new(NonceSequencer::new());
    let (dispatcher, work_rx) = QueueDispatcher::new(settings.relay.worker_count * 64);
    let dispatcher = Arc::new(dispatcher);

    let pipeline = Arc::new(SubmissionPipeline::new(
        ledger.clone(),
        gateways.clone(),
        sequencer.clone(),
        settings.relay.clone(),
        wallet.address(),
    ));
    pipeline
        .initialize_nonces()
        .await
        .context("Nonce reconciliation failed")?;
    info!("Nonce sequencer reconciled with chains and ledger");

    let confirmation_depths: HashMap<u64, u64> = settings
        .enabled_chains()
        .iter()
        .map(|(_, c)| (c.chain_id, c.confirmation_blocks))
        .collect();
    let poller = Arc::new(ConfirmationPoller::new(
        ledger.clone(),
        gateways.clone(),
        sequencer.clone(),
        settings.relay.clone(),
        confirmation_depths,
        wallet.address(),
    ));

    let validator = Arc::new(RequestValidator::new(
        registry.clone(),
        ledger.clone(),
        gateways.clone(),
        dispatcher.clone(),
    ));

    // API server
    let api_handle = tokio::spawn({
        let api_config = settings.api.clone();
        let state = api::AppState {
            validator,
            ledger: ledger.clone(),
            registry: registry.clone(),
            gateways: gateways.clone(),
        };
        async move {
            if let Err(e) = api::run_server(api_config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Submission pipeline
    let pipeline_handle = tokio::spawn({
        let pipeline = pipeline.clone();
        async move {
            if let Err(e) = pipeline.run(work_rx).await {
                error!("Submission pipeline error: {}", e);
            }
        }
    });

    // Confirmation poller
    let poller_handle = tokio::spawn({
        let poller = poller.clone();
        async move {
            if let Err(e) = poller.run().await {
                error!("Confirmation poller error: {}", e);
            }
        }
    });

    // Bid refresh loop
    let bid_handle = tokio::spawn({
        let registry = registry.clone();
        let ledger = ledger.clone();
        let interval = settings.bids.refresh_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;
                let refreshed = registry.refresh();
                metrics::record_bids_refreshed(refreshed);
                persist_bids(&registry, &ledger).await;
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let gateways = gateways.clone();
        let ledger = ledger.clone();
        let interval = settings.relay.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                for (chain_id, healthy) in gateways.health_check().await {
                    metrics::record_chain_health(chain_id, healthy);
                    if !healthy {
                        warn!("Chain {} health check failed", chain_id);
                    }
                }

                if let Err(e) = ledger.stats().await {
                    warn!("Ledger health check failed: {}", e);
                }
            }
        }
    });

    info!("Chainferry is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Stop intake and workers before tearing down shared state.
    pipeline.stop().await;
    poller.stop().await;

    api_handle.abort();
    pipeline_handle.abort();
    poller_handle.abort();
    bid_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Chainferry stopped");
    Ok(())
}

fn load_wallet(settings: &Settings) -> Result<LocalWallet> {
    let env_name = settings
        .wallet
        .private_key_env
        .clone()
        .unwrap_or_else(|| "CHAINFERRY_PRIVATE_KEY".to_string());
    let key = std::env::var(&env_name)
        .with_context(|| format!("Relay private key not found in ${}", env_name))?;
    key.trim_start_matches("0x")
        .parse::<LocalWallet>()
        .context("Relay private key is not valid")
}

/// Bids are served from memory; persistence is for audit only, so a store
/// failure is reported but never blocks issuance.
async fn persist_bids(registry: &BidRegistry, ledger: &Arc<dyn Ledger>) {
    for bid in registry.current_bids() {
        if let Err(e) = ledger.store_bid(&bid).await {
            warn!("Failed to persist bid {}: {}", hex::encode(bid.id), e);
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chainferry=debug,sqlx=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
