//! fhe-infer: privacy-preserving inference over homomorphically encrypted features
//!
//! A client quantizes and encrypts feature vectors under a per-session key
//! pair and ships them, together with the public evaluation key, to a server
//! that evaluates a compiled model circuit without ever seeing plaintext. The
//! client decrypts the results and can validate them against ground truth.
//!
//! Key components:
//! - [`keys::KeyManager`]: session key pair lifecycle and persistence
//! - [`codec::Codec`]: feature vectors to ciphertexts and back to predictions
//! - [`wire`]: request/response envelopes (base64 JSON) and the binary file backend
//! - [`evaluator::Evaluator`]: server-side evaluation with a circuit version gate
//! - [`orchestrator::Orchestrator`]: chunked, concurrent submission with retries
//! - [`validation`]: per-file and weighted aggregate match rates
//! - [`engine`]: the FHE capability interface and the simulation backend

pub mod codec;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod keys;
pub mod orchestrator;
pub mod session;
pub mod transport;
pub mod validation;
pub mod wire;

#[cfg(feature = "server")]
pub mod api;

pub use codec::{Codec, FeatureVector, Prediction};
pub use config::{ClientConfig, OrchestratorConfig, RetryPolicy};
pub use engine::{
    CircuitSpecs, ClientEngine, ServerCircuit, ServerEngine, SimulatedClient, SimulatedServer,
};
pub use error::{Error, Result};
pub use evaluator::Evaluator;
pub use keys::{KeyId, KeyManager, KeyPair, KeyState, PrivateKeyHandle};
pub use orchestrator::{BatchOutcome, ChunkFailure, Orchestrator};
pub use session::{PredictionOutcome, Session};
pub use transport::{LocalTransport, Transport};
pub use validation::{compare, AccuracyReport, FileReport, GroundTruthLabel, ValidationHarness};
pub use wire::{Ciphertext, EvaluationKeyBlob, RequestEnvelope, ResponseEnvelope};

#[cfg(feature = "server")]
pub use transport::HttpTransport;
