//! HTTP transport (reqwest) against `fhe-infer-server`

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use tracing::debug;

use crate::api::{ErrorKind, ErrorResponse, ServerParams};
use crate::error::{Error, Result};
use crate::wire::{RequestEnvelope, ResponseEnvelope};

use super::Transport;

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the server's active circuit version and input dimension
    pub async fn params(&self) -> Result<ServerParams> {
        let response = self
            .client
            .get(format!("{}/params", self.base_url))
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), None));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("invalid /params body: {}", e)))
    }

    async fn post_evaluate(&self, request: RequestEnvelope) -> Result<ResponseEnvelope> {
        let response = self
            .client
            .post(format!("{}/evaluate", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| Error::Protocol(format!("invalid response envelope: {}", e)));
        }

        let body = response.json::<ErrorResponse>().await.ok();
        debug!(
            correlation_id = request.correlation_id,
            status = status.as_u16(),
            "Server rejected request"
        );
        Err(status_error(status, body))
    }
}

impl Transport for HttpTransport {
    fn evaluate(
        &self,
        request: RequestEnvelope,
    ) -> impl Future<Output = Result<ResponseEnvelope>> + Send {
        self.post_evaluate(request)
    }
}

fn status_error(status: StatusCode, body: Option<ErrorResponse>) -> Error {
    let message = body
        .as_ref()
        .map(|b| b.error.clone())
        .unwrap_or_else(|| format!("server answered {}", status));

    match (status, body) {
        (
            StatusCode::CONFLICT,
            Some(ErrorResponse {
                kind: ErrorKind::VersionMismatch,
                expected_version: Some(expected),
                actual_version: Some(actual),
                ..
            }),
        ) => Error::VersionMismatch { expected, actual },
        (StatusCode::UNPROCESSABLE_ENTITY, _) => Error::Engine(message),
        (StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS, _) => {
            Error::Transport(message)
        }
        (s, _) if s.is_server_error() => Error::Transport(message),
        _ => Error::Protocol(format!("{}: {}", status, message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let mut conflict = ErrorResponse::new(ErrorKind::VersionMismatch, "stale");
        conflict.expected_version = Some(3);
        conflict.actual_version = Some(2);
        assert!(matches!(
            status_error(StatusCode::CONFLICT, Some(conflict)),
            Error::VersionMismatch { expected: 3, actual: 2 }
        ));

        assert!(matches!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, None),
            Error::Engine(_)
        ));
        assert!(status_error(StatusCode::BAD_GATEWAY, None).is_retryable());
        assert!(!status_error(StatusCode::BAD_REQUEST, None).is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        // Port 9 (discard) is not served on the test host
        let transport = HttpTransport::new("http://127.0.0.1:9/", Duration::from_secs(2)).unwrap();
        assert_eq!(transport.base_url(), "http://127.0.0.1:9");

        let err = transport.params().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
