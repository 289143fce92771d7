//! Server-side evaluation
//!
//! The evaluator holds no plaintext and no private key. It checks versions and
//! key binding, then hands each ciphertext to the engine. Payload bytes are
//! never logged.

use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::engine::ServerEngine;
use crate::error::{Error, Result};
use crate::wire::{Ciphertext, EvaluationKeyBlob, RequestEnvelope, ResponseEnvelope};

/// Evaluates ciphertexts against one compiled circuit
#[derive(Clone)]
pub struct Evaluator {
    engine: Arc<dyn ServerEngine>,
}

impl Evaluator {
    pub fn new(engine: Arc<dyn ServerEngine>) -> Self {
        Self { engine }
    }

    /// Version of the active circuit
    pub fn circuit_version(&self) -> u32 {
        self.engine.circuit_version()
    }

    pub fn input_dim(&self) -> usize {
        self.engine.input_dim()
    }

    /// Evaluate one ciphertext under `evaluation_key`
    pub fn run(&self, ciphertext: &Ciphertext, evaluation_key: &EvaluationKeyBlob) -> Result<Ciphertext> {
        self.check_version(ciphertext.circuit_version)?;
        self.check_version(evaluation_key.circuit_version)?;
        if ciphertext.key_id != evaluation_key.key_id {
            return Err(Error::KeyMismatch {
                expected: evaluation_key.key_id,
                actual: ciphertext.key_id,
            });
        }

        Ok(Ciphertext {
            circuit_version: ciphertext.circuit_version,
            key_id: ciphertext.key_id,
            bytes: self.run_bytes(&ciphertext.bytes, &evaluation_key.bytes)?,
        })
    }

    /// Evaluate every ciphertext of a request, in parallel, preserving order
    pub fn evaluate(&self, request: &RequestEnvelope) -> Result<ResponseEnvelope> {
        self.check_version(request.schema_version)?;

        let start = Instant::now();
        let payload = request
            .payload
            .par_iter()
            .map(|bytes| self.run_bytes(bytes, &request.evaluation_key))
            .collect::<Result<Vec<_>>>()?;

        info!(
            correlation_id = request.correlation_id,
            key_id = %request.key_id,
            ciphertexts = payload.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Evaluated request"
        );

        Ok(ResponseEnvelope::for_request(request, payload))
    }

    fn check_version(&self, version: u32) -> Result<()> {
        let active = self.engine.circuit_version();
        if version != active {
            return Err(Error::VersionMismatch {
                expected: active,
                actual: version,
            });
        }
        Ok(())
    }

    fn run_bytes(&self, ciphertext: &[u8], evaluation_key: &[u8]) -> Result<Vec<u8>> {
        self.engine
            .run(ciphertext, evaluation_key)
            .map_err(|e| match e {
                Error::Engine(_) => e,
                other => {
                    debug!("Engine failure mapped to engine error: {}", other);
                    Error::Engine(other.to_string())
                }
            })
    }
}
