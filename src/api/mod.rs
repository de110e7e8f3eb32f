//! HTTP API: transfer intake, status lookups, bid discovery, and monitoring

use crate::bids::BidRegistry;
use crate::chain::GatewayManager;
use crate::config::ApiConfig;
use crate::error::{RelayError, RelayResult};
use crate::ledger::Ledger;
use crate::validate::{RequestValidator, SignedTransferRequest, ValidationOutcome};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub validator: Arc<RequestValidator>,
    pub ledger: Arc<dyn Ledger>,
    pub registry: Arc<BidRegistry>,
    pub gateways: Arc<GatewayManager>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/transfers", post(submit_transfer))
        .route("/v1/transfers/:id", get(get_transfer))
        .route("/v1/bids", get(get_bid))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RelayResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayError::Internal(e.to_string()))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayError::Internal(e.to_string()))?;

    Ok(())
}

/// Accept a signed transfer request. Duplicates return the existing record.
async fn submit_transfer(
    State(state): State<AppState>,
    Json(request): Json<SignedTransferRequest>,
) -> Response {
    match state.validator.validate(&request).await {
        Ok(ValidationOutcome::Accepted(record)) => (
            StatusCode::OK,
            Json(TransferResponse {
                request_id: format!("0x{}", record.request_id_hex()),
                state: record.state.to_string(),
            }),
        )
            .into_response(),
        Ok(ValidationOutcome::Rejected(reason)) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: reason.to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            warn!("Transfer intake failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: "service temporarily unavailable".to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Look up the lifecycle state of a transfer by request id.
async fn get_transfer(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(id) = parse_request_id(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "request id must be 32 bytes of hex".to_string(),
            }),
        )
            .into_response();
    };

    match state.ledger.get(&id).await {
        Ok(Some(record)) => (
            StatusCode::OK,
            Json(TransferStatusResponse {
                request_id: format!("0x{}", record.request_id_hex()),
                state: record.state.to_string(),
                source_chain: record.source_chain,
                dest_chain: record.dest_chain,
                amount: record.amount.to_string(),
                fee: record.fee.to_string(),
                tx_hash: record.tx_hash.map(|h| format!("{:?}", h)),
                retry_count: record.retry_count,
                updated_at: record.updated_at.timestamp(),
            }),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "unknown transfer".to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            warn!("Transfer lookup failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: "service temporarily unavailable".to_string(),
                }),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct BidQuery {
    source_chain: u64,
    dest_chain: u64,
    token: String,
}

/// The current signed bid for a route, for clients building requests.
async fn get_bid(State(state): State<AppState>, Query(query): Query<BidQuery>) -> Response {
    let Ok(token) = query.token.parse() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "token must be a hex address".to_string(),
            }),
        )
            .into_response();
    };

    match state
        .registry
        .current_bid(query.source_chain, query.dest_chain, token)
    {
        Some(bid) => (
            StatusCode::OK,
            Json(BidResponse {
                bid_id: format!("0x{}", hex::encode(bid.id)),
                source_chain: bid.source_chain,
                dest_chain: bid.dest_chain,
                token: format!("{:?}", bid.token),
                fee: bid.fee.to_string(),
                max_amount: bid.max_amount.to_string(),
                valid_from: bid.valid_from.timestamp(),
                valid_until: bid.valid_until.timestamp(),
                signature: format!("0x{}", bid.signature),
                signer: format!("{:?}", state.registry.signer_address()),
            }),
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "no current bid for route".to_string(),
            }),
        )
            .into_response(),
    }
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify the store and every chain connection
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.ledger.stats().await.is_ok();

    let chain_health = state.gateways.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let response = ReadinessResponse {
        ready: store_ok && chains_ok,
        store: store_ok,
        chains: chains_ok,
        details: chain_health
            .into_iter()
            .map(|(id, h)| ChainHealth {
                chain_id: id,
                healthy: h,
            })
            .collect(),
    };

    let status = if response.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

/// Per-state transfer counts
async fn get_stats(State(state): State<AppState>) -> Response {
    match state.ledger.stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(StatsResponse {
                accepted: stats.accepted,
                submitting: stats.submitting,
                submitted: stats.submitted,
                confirmed: stats.confirmed,
                failed: stats.failed,
            }),
        )
            .into_response(),
        Err(e) => {
            warn!("Stats query failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "stats unavailable".to_string(),
                }),
            )
                .into_response()
        }
    }
}

fn parse_request_id(s: &str) -> Option<[u8; 32]> {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(stripped).ok()?;
    bytes.try_into().ok()
}

// Response types

#[derive(Serialize)]
struct TransferResponse {
    request_id: String,
    state: String,
}

#[derive(Serialize)]
struct TransferStatusResponse {
    request_id: String,
    state: String,
    source_chain: u64,
    dest_chain: u64,
    amount: String,
    fee: String,
    tx_hash: Option<String>,
    retry_count: u32,
    updated_at: i64,
}

#[derive(Serialize)]
struct BidResponse {
    bid_id: String,
    source_chain: u64,
    dest_chain: u64,
    token: String,
    fee: String,
    max_amount: String,
    valid_from: i64,
    valid_until: i64,
    signature: String,
    signer: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
}

#[derive(Serialize)]
struct StatsResponse {
    accepted: u64,
    submitting: u64,
    submitted: u64,
    confirmed: u64,
    failed: u64,
}
