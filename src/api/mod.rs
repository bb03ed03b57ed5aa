//! HTTP API for health checks, swap status, submission, refunds and wallet
//! identity

use crate::atom::{AtomError, AtomFactory, ChallengeSignature, WalletBalance, Wallets};
use crate::config::ApiConfig;
use crate::coordination::SwapEngine;
use crate::error::{SwapperError, SwapperResult};
use crate::state::SwapStatus;
use crate::swap::{Request, SwapError};
use crate::OrderId;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state
pub struct AppState<F: AtomFactory> {
    pub engine: Arc<SwapEngine<F>>,
}

impl<F: AtomFactory> Clone for AppState<F> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

pub fn router<F: AtomFactory + Wallets + 'static>(engine: Arc<SwapEngine<F>>) -> Router {
    Router::new()
        .route("/health", get(health_check::<F>))
        .route("/status/:order_id", get(get_status::<F>))
        .route("/swaps", post(submit_swap::<F>))
        .route("/refunds", post(refund_swap::<F>))
        .route("/balances", get(get_balances::<F>))
        .route("/whoami/:challenge", get(whoami::<F>))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { engine })
}

/// Run the HTTP API server
pub async fn run_server<F: AtomFactory + Wallets + 'static>(
    config: ApiConfig,
    engine: Arc<SwapEngine<F>>,
) -> SwapperResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| SwapperError::Internal(format!("bind {}: {}", addr, e)))?;
    axum::serve(listener, router(engine))
        .await
        .map_err(|e| SwapperError::Internal(e.to_string()))?;

    Ok(())
}

/// Error body returned by every failing endpoint
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<SwapperError> for ApiError {
    fn from(e: SwapperError) -> Self {
        let status = match &e {
            SwapperError::InFlight(_) => StatusCode::CONFLICT,
            SwapperError::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
            SwapperError::Atom(AtomError::UnknownChain(_))
            | SwapperError::Swap(SwapError::SamePriority(_)) => StatusCode::BAD_REQUEST,
            SwapperError::Swap(SwapError::Atom(AtomError::NotExpired { .. })) => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

fn parse_order_id(raw: &str) -> Result<OrderId, ApiError> {
    let bytes = hex::decode(raw.trim_start_matches("0x"))
        .map_err(|e| ApiError::bad_request(format!("order id: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| ApiError::bad_request("order id must be 32 bytes"))
}

/// Liveness plus store reachability
async fn health_check<F: AtomFactory + Wallets + 'static>(
    State(state): State<AppState<F>>,
) -> impl IntoResponse {
    let store_ok = match state.engine.store().health_check().await {
        Ok(()) => true,
        Err(e) => {
            warn!("Store health check failed: {}", e);
            false
        }
    };
    let code = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthResponse {
            status: if store_ok { "ok" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            store: store_ok,
        }),
    )
}

async fn get_status<F: AtomFactory + Wallets + 'static>(
    State(state): State<AppState<F>>,
    Path(order_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let id = parse_order_id(&order_id)?;
    let status = state
        .engine
        .store()
        .status(&id)
        .await
        .map_err(SwapperError::from)?;

    Ok(Json(StatusResponse {
        order_id: hex::encode(id),
        status,
        in_flight: state.engine.is_in_flight(&id),
    }))
}

async fn submit_swap<F: AtomFactory + Wallets + 'static>(
    State(state): State<AppState<F>>,
    Json(request): Json<Request>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let order_id = hex::encode(request.id);
    state.engine.queue(request).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { order_id })))
}

async fn refund_swap<F: AtomFactory + Wallets + 'static>(
    State(state): State<AppState<F>>,
    Json(request): Json<Request>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let order_id = hex::encode(request.id);
    state.engine.refund(request).await?;
    Ok(Json(SubmitResponse { order_id }))
}

async fn get_balances<F: AtomFactory + Wallets + 'static>(
    State(state): State<AppState<F>>,
) -> Result<Json<BTreeMap<String, WalletBalance>>, ApiError> {
    let balances = state
        .engine
        .factory()
        .balances()
        .await
        .map_err(SwapperError::from)?;
    Ok(Json(balances))
}

/// Sign `challenge` with every chain key so a caller can tie this daemon to
/// its addresses
async fn whoami<F: AtomFactory + Wallets + 'static>(
    State(state): State<AppState<F>>,
    Path(challenge): Path<String>,
) -> Result<Json<WhoAmIResponse>, ApiError> {
    if challenge.is_empty() {
        return Err(ApiError::bad_request("empty challenge"));
    }
    let signatures = state
        .engine
        .factory()
        .sign_challenge(&challenge)
        .await
        .map_err(SwapperError::from)?;

    Ok(Json(WhoAmIResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        challenge,
        signatures,
    }))
}

// Response types

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    store: bool,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    order_id: String,
    status: SwapStatus,
    in_flight: bool,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    order_id: String,
}

#[derive(Debug, Serialize)]
struct WhoAmIResponse {
    version: String,
    challenge: String,
    signatures: BTreeMap<String, ChallengeSignature>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}
