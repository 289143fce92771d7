//! Client session
//!
//! A [`Session`] owns the key pair and hands out [`Codec`]s bound to it. All
//! client-side state lives here; nothing is process-global.

use std::path::PathBuf;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::info;

use crate::codec::{Codec, FeatureVector, Prediction};
use crate::engine::ClientEngine;
use crate::error::{Error, Result};
use crate::keys::{KeyId, KeyManager};
use crate::orchestrator::{ChunkFailure, Orchestrator};
use crate::transport::Transport;
use crate::wire::{Ciphertext, EvaluationKeyBlob, RequestEnvelope, ResponseEnvelope};

/// Predictions for a dataset, in input order
#[derive(Debug)]
pub struct PredictionOutcome {
    /// `None` where the chunk holding the input failed
    pub predictions: Vec<Option<Prediction>>,
    pub failures: Vec<ChunkFailure>,
}

impl PredictionOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_indices(&self) -> Vec<usize> {
        self.predictions
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    /// All predictions, or the first chunk failure
    pub fn into_predictions(self) -> Result<Vec<Prediction>> {
        if let Some(failure) = self.failures.into_iter().next() {
            return Err(failure.error);
        }
        self.predictions
            .into_iter()
            .map(|p| p.ok_or_else(|| Error::Protocol("missing prediction".into())))
            .collect()
    }
}

pub struct Session {
    keys: KeyManager,
}

impl Session {
    /// Build a key manager for `engine` and initialize it. With a `key_dir`,
    /// persisted keys are reused.
    pub fn open(engine: Arc<dyn ClientEngine>, key_dir: Option<PathBuf>) -> Result<Self> {
        let mut keys = match key_dir {
            Some(dir) => KeyManager::with_key_dir(engine, dir),
            None => KeyManager::new(engine),
        };
        keys.initialize()?;
        Ok(Self { keys })
    }

    pub fn key_manager(&self) -> &KeyManager {
        &self.keys
    }

    pub fn key_id(&self) -> Result<KeyId> {
        self.keys.key_id().ok_or(Error::NotInitialized)
    }

    pub fn circuit_version(&self) -> u32 {
        self.keys.engine().specs().circuit_version
    }

    pub fn evaluation_key(&self) -> Result<&EvaluationKeyBlob> {
        self.keys.evaluation_key_blob()
    }

    pub fn codec(&self) -> Result<Codec<'_>> {
        Ok(Codec::new(self.keys.engine().as_ref(), self.keys.key_pair()?))
    }

    pub fn encrypt(&self, features: &[FeatureVector]) -> Result<Vec<Ciphertext>> {
        self.codec()?.encode_batch(features)
    }

    pub fn decrypt(&self, ciphertexts: &[Ciphertext]) -> Result<Vec<Prediction>> {
        self.codec()?.decode_batch(ciphertexts)
    }

    /// Encrypt `features` into a single request envelope
    pub fn request_envelope(
        &self,
        correlation_id: u64,
        features: &[FeatureVector],
    ) -> Result<RequestEnvelope> {
        let ciphertexts = self.encrypt(features)?;
        RequestEnvelope::new(correlation_id, self.evaluation_key()?, &ciphertexts)
    }

    pub fn decrypt_response(&self, response: &ResponseEnvelope) -> Result<Vec<Prediction>> {
        self.decrypt(&response.ciphertexts())
    }

    /// Encrypt, evaluate remotely in chunks and decrypt
    pub async fn predict<T: Transport + 'static>(
        &self,
        orchestrator: &Orchestrator<T>,
        features: &[FeatureVector],
    ) -> Result<PredictionOutcome> {
        let ciphertexts = self.encrypt(features)?;
        let evaluation_key = self.evaluation_key()?.clone();

        let outcome = orchestrator.submit(&evaluation_key, ciphertexts).await?;

        let codec = self.codec()?;
        let predictions = outcome
            .outputs
            .par_iter()
            .map(|o| o.as_ref().map(|ct| codec.decode(ct)).transpose())
            .collect::<Result<Vec<_>>>()?;

        Ok(PredictionOutcome {
            predictions,
            failures: outcome.failures,
        })
    }

    /// Replace the key pair. Results bound to the old key id stop decoding.
    pub fn rotate(&mut self) -> Result<()> {
        self.keys.rotate()?;
        info!("Session now uses key {}", self.key_id()?);
        Ok(())
    }
}
