//! Client-local API
//!
//! Runs next to the key owner and exposes the session to local tools:
//!
//! - `POST /encrypt`: feature rows (JSON) in, [`RequestEnvelope`] out
//! - `POST /decrypt`: [`ResponseEnvelope`] in, predictions out
//! - `POST /process`: multipart form with a `function` field (`encrypt` or
//!   `decrypt`) and an `input_file`. Encryption takes a CSV feature file,
//!   decryption takes a binary ciphertext batch file.
//!
//! The private key never appears in any response.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::routing::post;
use axum::{Json, Router};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::codec::{FeatureVector, Prediction};
use crate::dataset::parse_features;
use crate::session::Session;
use crate::wire::{decode_batch, RequestEnvelope, ResponseEnvelope};

use super::server::MAX_BODY_BYTES;
use super::{ApiError, ErrorKind, ErrorResponse};

#[derive(Clone)]
struct AppState {
    session: Arc<Session>,
}

/// Body of `POST /encrypt`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptRequest {
    /// Chosen at random when absent
    #[serde(default)]
    pub correlation_id: Option<u64>,
    pub features: Vec<FeatureVector>,
}

/// Body returned by `POST /decrypt` and by `/process` with `function=decrypt`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptResponse {
    pub predictions: Vec<Prediction>,
}

pub fn router(session: Arc<Session>) -> Router {
    Router::new()
        .route("/encrypt", post(handle_encrypt))
        .route("/decrypt", post(handle_decrypt))
        .route("/process", post(handle_process))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(AppState { session })
}

async fn blocking<F, R>(f: F) -> Result<R, ApiError>
where
    F: FnOnce() -> crate::error::Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| {
            ApiError(ErrorResponse::new(
                ErrorKind::Internal,
                format!("task failed: {}", e),
            ))
        })?
        .map_err(ApiError::from)
}

async fn encrypt(
    session: Arc<Session>,
    correlation_id: Option<u64>,
    features: Vec<FeatureVector>,
) -> Result<RequestEnvelope, ApiError> {
    let correlation_id = correlation_id.unwrap_or_else(|| rand::thread_rng().gen());
    let count = features.len();
    let envelope = blocking(move || session.request_envelope(correlation_id, &features)).await?;
    info!(correlation_id, "Encrypted {} feature vectors", count);
    Ok(envelope)
}

async fn handle_encrypt(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<RequestEnvelope>, ApiError> {
    let request: EncryptRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::malformed(format!("invalid encrypt request: {}", e)))?;
    Ok(Json(
        encrypt(state.session, request.correlation_id, request.features).await?,
    ))
}

async fn handle_decrypt(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<DecryptResponse>, ApiError> {
    let response: ResponseEnvelope = serde_json::from_slice(&body)
        .map_err(|e| ApiError::malformed(format!("invalid response envelope: {}", e)))?;
    let session = state.session.clone();
    let predictions = blocking(move || session.decrypt_response(&response)).await?;
    Ok(Json(DecryptResponse { predictions }))
}

/// Response of `/process`: an envelope for `encrypt`, predictions for `decrypt`
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProcessResponse {
    Encrypted(RequestEnvelope),
    Decrypted(DecryptResponse),
}

async fn handle_process(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ProcessResponse>, ApiError> {
    let mut function = None;
    let mut input = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::malformed(format!("invalid multipart body: {}", e)))?
    {
        match field.name() {
            Some("function") => {
                function = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::malformed(e.to_string()))?,
                );
            }
            Some("input_file") => {
                input = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::malformed(e.to_string()))?,
                );
            }
            _ => {}
        }
    }

    let function = function.ok_or_else(|| ApiError::malformed("missing field 'function'"))?;
    if function != "encrypt" && function != "decrypt" {
        return Err(ApiError::malformed(
            "Invalid function type. Use 'encrypt' or 'decrypt'.",
        ));
    }
    let input = input.ok_or_else(|| ApiError::malformed("missing field 'input_file'"))?;

    if function == "encrypt" {
        let features = parse_features(&input[..])
            .map_err(|_| ApiError::malformed("Invalid input file format for encryption."))?;
        let envelope = encrypt(state.session, None, features).await?;
        Ok(Json(ProcessResponse::Encrypted(envelope)))
    } else {
        let ciphertexts = decode_batch(&input)
            .map_err(|_| ApiError::malformed("Invalid input file format for decryption."))?;
        let session = state.session.clone();
        let predictions = blocking(move || session.decrypt(&ciphertexts)).await?;
        Ok(Json(ProcessResponse::Decrypted(DecryptResponse { predictions })))
    }
}
