//! HTTP surfaces
//!
//! - [`server`]: the evaluation server (`/health`, `/params`, `/evaluate`)
//! - [`client`]: the client-local API (`/encrypt`, `/decrypt`, `/process`)
//!
//! Both answer failures with an [`ErrorResponse`] body.

pub mod client;
pub mod server;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Failure class reported in [`ErrorResponse::kind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 400: the request could not be parsed or fails local checks
    Malformed,
    /// 409: envelope or key built for another circuit version
    VersionMismatch,
    /// 422: the engine rejected the ciphertext or evaluation key
    Engine,
    /// 500
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::Malformed => StatusCode::BAD_REQUEST,
            ErrorKind::VersionMismatch => StatusCode::CONFLICT,
            ErrorKind::Engine => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: ErrorKind,
    /// Active circuit version, set on version mismatches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u32>,
    /// Version the request was built for, set on version mismatches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_version: Option<u32>,
}

impl ErrorResponse {
    pub fn new(kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            kind,
            expected_version: None,
            actual_version: None,
        }
    }
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        let kind = match err {
            Error::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            Error::Engine(_) => ErrorKind::Engine,
            Error::ShapeMismatch { .. }
            | Error::Encoding(_)
            | Error::KeyMismatch { .. }
            | Error::Decryption(_)
            | Error::Protocol(_)
            | Error::LengthMismatch { .. }
            | Error::Serialization(_) => ErrorKind::Malformed,
            Error::Transport(_) | Error::NotInitialized | Error::KeyStore(_) | Error::Io(_) => {
                ErrorKind::Internal
            }
        };
        let mut response = ErrorResponse::new(kind, err.to_string());
        if let Error::VersionMismatch { expected, actual } = err {
            response.expected_version = Some(*expected);
            response.actual_version = Some(*actual);
        }
        response
    }
}

/// Handler error: status plus [`ErrorResponse`] body
#[derive(Debug)]
pub struct ApiError(pub ErrorResponse);

impl ApiError {
    pub fn malformed(error: impl Into<String>) -> Self {
        Self(ErrorResponse::new(ErrorKind::Malformed, error))
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(ErrorResponse::from(&err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0.kind.status(), Json(self.0)).into_response()
    }
}

/// Body of `GET /params`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerParams {
    pub version: String,
    pub circuit_version: u32,
    pub input_dim: usize,
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let version = ErrorResponse::from(&Error::VersionMismatch {
            expected: 2,
            actual: 1,
        });
        assert_eq!(version.kind.status(), StatusCode::CONFLICT);
        assert_eq!(version.expected_version, Some(2));

        let engine = ErrorResponse::from(&Error::Engine("bad key".into()));
        assert_eq!(engine.kind.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let json = serde_json::to_value(ErrorResponse::new(ErrorKind::Malformed, "x")).unwrap();
        assert_eq!(json["kind"], "malformed");
        assert!(json.get("expected_version").is_none());
    }
}
