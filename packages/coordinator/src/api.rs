//! HTTP API
//!
//! - GET /health - Liveness
//! - GET /metrics - Prometheus metrics
//! - GET /status - Transfer counts per status, uptime
//! - POST /transfers - Request a transfer
//! - GET /transfers/{id} - Transfer snapshot
//! - GET /derive/{chain}?account=&path= - MPC-controlled foreign address

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::coordinator::TransferCoordinator;
use crate::error::BridgeError;
use crate::signer::ForeignAddress;
use crate::types::{Chain, TransferId, TransferRecord, TransferRequest, TransferStatus};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<TransferCoordinator>,
    pub started_at: Instant,
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    uptime_seconds: u64,
    transfers: BTreeMap<&'static str, i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransferAccepted {
    pub transfer_id: TransferId,
    pub status: TransferStatus,
}

#[derive(Debug, Deserialize)]
pub struct DeriveQuery {
    pub account: String,
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// Error wrapper mapping `BridgeError` kinds onto HTTP statuses
pub struct ApiError(pub BridgeError);

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        ApiError(e)
    }
}

pub fn status_code(error: &BridgeError) -> StatusCode {
    match error {
        BridgeError::InvalidAmount
        | BridgeError::InvalidRecipient(_)
        | BridgeError::InvalidTransferId(_)
        | BridgeError::UnsupportedChain(_)
        | BridgeError::UnsupportedRoute(..) => StatusCode::BAD_REQUEST,
        BridgeError::ConflictingRequest(_) | BridgeError::DuplicateTransferId(_) => {
            StatusCode::CONFLICT
        }
        BridgeError::NotFound(_) => StatusCode::NOT_FOUND,
        BridgeError::ChainUnavailable(_) | BridgeError::SigningUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_code(&self.0);
        // Internal details stay in the log
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %self.0, "Request failed");
            self.0.failure_reason()
        } else {
            self.0.to_string()
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.kind(),
                message,
            }),
        )
            .into_response()
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let counts = state.coordinator.status_counts().await?;
    Ok(Json(StatusResponse {
        status: "ok".to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        transfers: counts.into_iter().map(|(s, n)| (s.as_str(), n)).collect(),
    }))
}

async fn request_transfer(
    State(state): State<AppState>,
    Json(request): Json<TransferRequest>,
) -> Result<(StatusCode, Json<TransferAccepted>), ApiError> {
    let transfer_id = state.coordinator.request_transfer(request).await?;
    let record = state.coordinator.get_status(&transfer_id).await?;

    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        if let Err(e) = coordinator.drive(transfer_id).await {
            warn!(transfer_id = %transfer_id, error = %e, "Transfer drive failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(TransferAccepted {
            transfer_id,
            status: record.status,
        }),
    ))
}

async fn get_transfer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TransferRecord>, ApiError> {
    let transfer_id: TransferId = id
        .parse()
        .map_err(|_| BridgeError::InvalidTransferId(id.clone()))?;
    let record = state.coordinator.get_status(&transfer_id).await?;
    Ok(Json(record))
}

async fn derive_address(
    State(state): State<AppState>,
    Path(chain): Path<String>,
    Query(query): Query<DeriveQuery>,
) -> Result<Json<ForeignAddress>, ApiError> {
    let chain: Chain = chain.parse()?;
    let address = state
        .coordinator
        .derive_address(&query.account, chain, query.path.as_deref())?;
    Ok(Json(address))
}

pub fn router(coordinator: Arc<TransferCoordinator>) -> Router {
    let state = AppState {
        coordinator,
        started_at: Instant::now(),
    };

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status))
        .route("/transfers", post(request_transfer))
        .route("/transfers/{id}", get(get_transfer))
        .route("/derive/{chain}", get(derive_address))
        .with_state(state)
}

/// Start the API server
pub async fn start_api_server(
    addr: SocketAddr,
    coordinator: Arc<TransferCoordinator>,
) -> eyre::Result<()> {
    let app = router(coordinator);

    info!(%addr, "API server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
