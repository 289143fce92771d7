//! Codec: feature vectors to ciphertexts and ciphertexts to predictions
//!
//! Encoding validates the input locally (dimension, finite values) before the
//! engine quantizes and encrypts it, then stamps the result with the key id
//! and circuit version. Decoding checks that stamp before touching the
//! engine, so a ciphertext from another key pair fails with a decryption
//! error that names both keys instead of yielding wrong data.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::engine::circuit::argmax;
use crate::engine::ClientEngine;
use crate::error::{Error, Result};
use crate::keys::KeyPair;
use crate::wire::Ciphertext;

/// One inference input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(Vec<f64>);

impl FeatureVector {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

impl From<Vec<f64>> for FeatureVector {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

/// Decoded, post-processed model output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Class label of the winning output
    pub label: i64,
    /// Index of the winning output
    pub class_index: usize,
    /// Post-processed scores (probabilities for classifiers)
    pub scores: Vec<f64>,
}

/// Encoder/decoder bound to one engine and one key pair
#[derive(Clone, Copy)]
pub struct Codec<'a> {
    engine: &'a dyn ClientEngine,
    keys: &'a KeyPair,
}

impl<'a> Codec<'a> {
    pub fn new(engine: &'a dyn ClientEngine, keys: &'a KeyPair) -> Self {
        Self { engine, keys }
    }

    /// Quantize, encrypt and serialize one feature vector
    pub fn encode(&self, vector: &FeatureVector) -> Result<Ciphertext> {
        let expected = self.engine.specs().input_dim();
        if vector.dim() != expected {
            return Err(Error::ShapeMismatch {
                expected,
                actual: vector.dim(),
            });
        }
        if let Some((i, x)) = vector
            .as_slice()
            .iter()
            .enumerate()
            .find(|(_, x)| !x.is_finite())
        {
            return Err(Error::Encoding(format!("feature {} is not finite ({})", i, x)));
        }

        let secret = self.keys.private_key().secret();
        let bytes = self
            .engine
            .quantize_encrypt_serialize(secret, vector.as_slice())?;

        Ok(Ciphertext {
            circuit_version: self.keys.circuit_version(),
            key_id: self.keys.key_id(),
            bytes,
        })
    }

    /// Decrypt, dequantize and post-process one evaluated ciphertext
    pub fn decode(&self, ciphertext: &Ciphertext) -> Result<Prediction> {
        if ciphertext.key_id != self.keys.key_id() {
            return Err(Error::Decryption(format!(
                "ciphertext is bound to key {}, active key is {}",
                ciphertext.key_id,
                self.keys.key_id()
            )));
        }
        if ciphertext.circuit_version != self.keys.circuit_version() {
            return Err(Error::Decryption(format!(
                "ciphertext comes from circuit version {}, active circuit version is {}",
                ciphertext.circuit_version,
                self.keys.circuit_version()
            )));
        }

        let secret = self.keys.private_key().secret();
        let raw = self
            .engine
            .deserialize_decrypt_dequantize(secret, &ciphertext.bytes)?;

        let specs = self.engine.specs();
        let scores = specs.post_processing.apply(&raw);
        let class_index =
            argmax(&scores).ok_or_else(|| Error::Decryption("circuit produced no outputs".into()))?;
        let label = *specs.classes.get(class_index).ok_or_else(|| {
            Error::Decryption(format!("output {} has no class label", class_index))
        })?;

        Ok(Prediction {
            label,
            class_index,
            scores,
        })
    }

    /// Encode in parallel; fails on the first invalid vector
    pub fn encode_batch(&self, vectors: &[FeatureVector]) -> Result<Vec<Ciphertext>> {
        vectors.par_iter().map(|v| self.encode(v)).collect()
    }

    /// Decode in parallel, preserving order
    pub fn decode_batch(&self, ciphertexts: &[Ciphertext]) -> Result<Vec<Prediction>> {
        ciphertexts.par_iter().map(|c| self.decode(c)).collect()
    }
}
