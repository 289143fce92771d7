#![cfg(feature = "server")]

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use fhe_infer::api::{self, ErrorKind, ErrorResponse, HealthResponse, ServerParams};
use fhe_infer::{
    Error, HttpTransport, Orchestrator, OrchestratorConfig, RequestEnvelope, ResponseEnvelope,
    RetryPolicy, Transport,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

async fn spawn_server(version: u32) -> (String, JoinHandle<()>) {
    let app = api::server::router(common::evaluator(version));
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr: SocketAddr = listener.local_addr().expect("local addr");

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server should run");
    });
    (format!("http://{}", addr), handle)
}

fn transport(base_url: &str) -> HttpTransport {
    HttpTransport::new(base_url, Duration::from_secs(10)).expect("client")
}

#[tokio::test]
async fn http_health_and_params() {
    let (base_url, handle) = spawn_server(3).await;
    let client = reqwest::Client::new();

    let health: HealthResponse = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .expect("request should succeed")
        .json()
        .await
        .expect("parse health");
    assert_eq!(health.status, "ok");

    let params: ServerParams = transport(&base_url).params().await.expect("params");
    assert_eq!(params.circuit_version, 3);
    assert_eq!(params.input_dim, 3);

    handle.abort();
}

#[tokio::test]
async fn http_predict_matches_plaintext() {
    let (base_url, handle) = spawn_server(common::CIRCUIT_VERSION).await;
    let session = common::session(common::CIRCUIT_VERSION);
    let orchestrator = Orchestrator::new(
        Arc::new(transport(&base_url)),
        OrchestratorConfig {
            chunk_size: 4,
            max_in_flight: 3,
            retry: RetryPolicy::no_retry(),
        },
    )
    .unwrap();

    let rows = common::ten_rows();
    let labels: Vec<i64> = session
        .predict(&orchestrator, &rows)
        .await
        .expect("predict should succeed")
        .into_predictions()
        .unwrap()
        .iter()
        .map(|p| p.label)
        .collect();
    assert_eq!(labels, common::labels(&rows));

    handle.abort();
}

#[tokio::test]
async fn http_version_gate_returns_409() {
    let (base_url, handle) = spawn_server(1).await;
    let stale = common::session(2);
    let request = stale.request_envelope(5, &common::ten_rows()[..2]).unwrap();

    let response = reqwest::Client::new()
        .post(format!("{}/evaluate", base_url))
        .json(&request)
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body: ErrorResponse = response.json().await.expect("parse error response");
    assert_eq!(body.kind, ErrorKind::VersionMismatch);
    assert_eq!(body.expected_version, Some(1));
    assert_eq!(body.actual_version, Some(2));

    // The transport surfaces the same failure as a non-retryable error
    let err = transport(&base_url).evaluate(request).await.unwrap_err();
    assert!(matches!(err, Error::VersionMismatch { expected: 1, actual: 2 }));
    assert!(!err.is_retryable());

    handle.abort();
}

#[tokio::test]
async fn http_malformed_and_engine_errors() {
    let (base_url, handle) = spawn_server(1).await;
    let client = reqwest::Client::new();

    let malformed = client
        .post(format!("{}/evaluate", base_url))
        .header("content-type", "application/json")
        .body(r#"{"schema_version": 1, "payload": "deadbeef"}"#)
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
    let body: ErrorResponse = malformed.json().await.unwrap();
    assert_eq!(body.kind, ErrorKind::Malformed);

    // Right version, but the evaluation key is garbage
    let session = common::session(1);
    let mut request: RequestEnvelope = session.request_envelope(9, &common::ten_rows()[..1]).unwrap();
    request.evaluation_key = vec![1, 2, 3];

    let rejected = client
        .post(format!("{}/evaluate", base_url))
        .json(&request)
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(rejected.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let err = transport(&base_url).evaluate(request).await.unwrap_err();
    assert!(matches!(err, Error::Engine(_)));

    handle.abort();
}

#[tokio::test]
async fn http_response_answers_request() {
    let (base_url, handle) = spawn_server(1).await;
    let session = common::session(1);
    let request = session.request_envelope(77, &common::ten_rows()).unwrap();

    let response: ResponseEnvelope = transport(&base_url)
        .evaluate(request.clone())
        .await
        .expect("evaluate");
    assert_eq!(response.correlation_id, 77);
    assert_eq!(response.payload.len(), 10);
    fhe_infer::wire::validate_response(&request, &response).unwrap();

    handle.abort();
}
