//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Request intake (accepted / rejected by reason)
//! - Transfer lifecycle (submitted, confirmed, failed, retried, reopened)
//! - Nonce management and recovery
//! - Bid issuance
//! - Chain connection status

use crate::error::RelayResult;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Intake metrics
    pub static ref REQUESTS_ACCEPTED: CounterVec = register_counter_vec!(
        "chainferry_requests_accepted_total",
        "Total transfer requests accepted",
        &["source_chain", "dest_chain"]
    ).unwrap();

    pub static ref REQUESTS_REJECTED: CounterVec = register_counter_vec!(
        "chainferry_requests_rejected_total",
        "Total transfer requests rejected by reason",
        &["reason"]
    ).unwrap();

    // Transfer lifecycle metrics
    pub static ref TRANSFERS_SUBMITTED: CounterVec = register_counter_vec!(
        "chainferry_transfers_submitted_total",
        "Total transfer transactions broadcast",
        &["chain_id"]
    ).unwrap();

    pub static ref TRANSFERS_CONFIRMED: CounterVec = register_counter_vec!(
        "chainferry_transfers_confirmed_total",
        "Total transfers confirmed at depth",
        &["chain_id"]
    ).unwrap();

    pub static ref TRANSFERS_FAILED: CounterVec = register_counter_vec!(
        "chainferry_transfers_failed_total",
        "Total transfers failed terminally",
        &["chain_id"]
    ).unwrap();

    pub static ref TRANSFERS_RETRIED: CounterVec = register_counter_vec!(
        "chainferry_transfers_retried_total",
        "Total transfer attempts rescheduled",
        &["chain_id"]
    ).unwrap();

    pub static ref TRANSFERS_REOPENED: CounterVec = register_counter_vec!(
        "chainferry_transfers_reopened_total",
        "Total confirmed transfers reopened by a reorg",
        &["chain_id"]
    ).unwrap();

    pub static ref TRANSFERS_RECOVERED: CounterVec = register_counter_vec!(
        "chainferry_transfers_recovered_total",
        "Total transfers reopened by the recovery sweep",
        &["chain_id"]
    ).unwrap();

    pub static ref SUBMISSION_LATENCY: HistogramVec = register_histogram_vec!(
        "chainferry_submission_latency_seconds",
        "Time from acceptance to broadcast",
        &["chain_id"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Nonce metrics
    pub static ref NONCES_RELEASED: CounterVec = register_counter_vec!(
        "chainferry_nonces_released_total",
        "Total nonce reservations returned unbroadcast",
        &["chain_id"]
    ).unwrap();

    // Bid metrics
    pub static ref BIDS_REFRESHED: CounterVec = register_counter_vec!(
        "chainferry_bids_refreshed_total",
        "Total bids signed and published",
        &[]
    ).unwrap();

    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "chainferry_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::error::RelayError::Internal(e.to_string()))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::error::RelayError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_request_accepted(source_chain: u64, dest_chain: u64) {
    REQUESTS_ACCEPTED
        .with_label_values(&[&source_chain.to_string(), &dest_chain.to_string()])
        .inc();
}

pub fn record_request_rejected(reason: &str) {
    REQUESTS_REJECTED.with_label_values(&[reason]).inc();
}

pub fn record_transfer_submitted(chain_id: u64) {
    TRANSFERS_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_transfer_confirmed(chain_id: u64) {
    TRANSFERS_CONFIRMED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_transfer_failed(chain_id: u64) {
    TRANSFERS_FAILED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_transfer_retried(chain_id: u64) {
    TRANSFERS_RETRIED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_transfer_reopened(chain_id: u64) {
    TRANSFERS_REOPENED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_transfer_recovered(chain_id: u64) {
    TRANSFERS_RECOVERED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_submission_latency(chain_id: u64, latency_secs: f64) {
    SUBMISSION_LATENCY
        .with_label_values(&[&chain_id.to_string()])
        .observe(latency_secs);
}

pub fn record_nonce_released(chain_id: u64) {
    NONCES_RELEASED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_bids_refreshed(count: usize) {
    BIDS_REFRESHED.with_label_values(&[]).inc_by(count as f64);
}

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}
