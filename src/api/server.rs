//! Evaluation server routes
//!
//! - `GET  /health`
//! - `GET  /params`: active circuit version and input dimension
//! - `POST /evaluate`: [`RequestEnvelope`] in, [`ResponseEnvelope`] out
//!
//! Evaluation runs on the blocking pool so large envelopes do not stall the
//! runtime.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::warn;

use crate::evaluator::Evaluator;
use crate::wire::{RequestEnvelope, ResponseEnvelope};

use super::{ApiError, ErrorKind, ErrorResponse, HealthResponse, ServerParams};

/// Upper bound for a request body (one chunk of ciphertexts plus the key)
pub const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    evaluator: Arc<Evaluator>,
}

pub fn router(evaluator: Arc<Evaluator>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/params", get(get_params))
        .route("/evaluate", post(handle_evaluate))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(AppState { evaluator })
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_params(State(state): State<AppState>) -> Json<ServerParams> {
    Json(ServerParams {
        version: env!("CARGO_PKG_VERSION").to_string(),
        circuit_version: state.evaluator.circuit_version(),
        input_dim: state.evaluator.input_dim(),
    })
}

async fn handle_evaluate(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ResponseEnvelope>, ApiError> {
    let request: RequestEnvelope = serde_json::from_slice(&body)
        .map_err(|e| ApiError::malformed(format!("invalid request envelope: {}", e)))?;
    let correlation_id = request.correlation_id;

    let evaluator = state.evaluator.clone();
    let result = tokio::task::spawn_blocking(move || evaluator.evaluate(&request))
        .await
        .map_err(|e| {
            ApiError(ErrorResponse::new(
                ErrorKind::Internal,
                format!("evaluation task failed: {}", e),
            ))
        })?;

    match result {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            warn!(correlation_id, "Rejected request: {}", e);
            Err(e.into())
        }
    }
}
