//! Request transports
//!
//! A transport carries one [`RequestEnvelope`] to an evaluator and brings
//! back its [`ResponseEnvelope`]. Failures that may succeed on a second try
//! (connection refused, timeouts, 5xx) surface as [`Error::Transport`];
//! everything the server rejected on its merits keeps its own variant so the
//! orchestrator does not retry it.
//!
//! [`Error::Transport`]: crate::error::Error::Transport

#[cfg(feature = "server")]
pub mod http;
pub mod local;

use std::future::Future;

use crate::error::Result;
use crate::wire::{RequestEnvelope, ResponseEnvelope};

#[cfg(feature = "server")]
pub use http::HttpTransport;
pub use local::LocalTransport;

/// One request/response round trip with an evaluator
pub trait Transport: Send + Sync {
    fn evaluate(
        &self,
        request: RequestEnvelope,
    ) -> impl Future<Output = Result<ResponseEnvelope>> + Send;
}
