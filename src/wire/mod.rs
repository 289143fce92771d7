//! Wire envelope exchanged between client and server
//!
//! # Canonical encoding
//!
//! Envelopes travel as JSON. Every byte field (`evaluation_key`, each
//! `payload` item) is encoded as **standard base64 with padding**
//! (RFC 4648 §4). No other binary-to-text encoding is accepted anywhere in
//! the protocol.
//!
//! # Versioning
//!
//! `schema_version` is the version of the compiled circuit. The server
//! rejects envelopes whose version differs from its active circuit, so an
//! evaluation key generated for a recompiled circuit is refused instead of
//! producing garbage.
//!
//! The binary [`file`] backend stores the same information on disk.

pub mod file;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::keys::KeyId;

pub use file::{decode_batch, encode_batch, load_batch, save_batch};

/// Base64 (standard alphabet, padded) for a single byte field
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&B64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        B64.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Base64 for an ordered list of byte blobs
mod base64_list {
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(items.len()))?;
        for item in items {
            seq.serialize_element(&B64.encode(item))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let texts = Vec::<String>::deserialize(deserializer)?;
        texts
            .iter()
            .map(|t| B64.decode(t.as_bytes()).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// Encrypted input or output, bound to the key pair and circuit that produced it
#[derive(Clone, PartialEq, Eq)]
pub struct Ciphertext {
    pub circuit_version: u32,
    pub key_id: KeyId,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for Ciphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ciphertext")
            .field("circuit_version", &self.circuit_version)
            .field("key_id", &self.key_id)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Public evaluation key; confers compute-only capability
#[derive(Clone, PartialEq, Eq)]
pub struct EvaluationKeyBlob {
    pub circuit_version: u32,
    pub key_id: KeyId,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for EvaluationKeyBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluationKeyBlob")
            .field("circuit_version", &self.circuit_version)
            .field("key_id", &self.key_id)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// One chunk of ciphertexts plus the key needed to evaluate them
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub schema_version: u32,
    pub correlation_id: u64,
    pub key_id: KeyId,
    #[serde(with = "base64_bytes")]
    pub evaluation_key: Vec<u8>,
    #[serde(with = "base64_list")]
    pub payload: Vec<Vec<u8>>,
}

impl RequestEnvelope {
    /// Build an envelope, checking every ciphertext against the evaluation key
    pub fn new(
        correlation_id: u64,
        evaluation_key: &EvaluationKeyBlob,
        ciphertexts: &[Ciphertext],
    ) -> Result<Self> {
        for ct in ciphertexts {
            if ct.circuit_version != evaluation_key.circuit_version {
                return Err(Error::VersionMismatch {
                    expected: evaluation_key.circuit_version,
                    actual: ct.circuit_version,
                });
            }
            if ct.key_id != evaluation_key.key_id {
                return Err(Error::KeyMismatch {
                    expected: evaluation_key.key_id,
                    actual: ct.key_id,
                });
            }
        }

        Ok(Self {
            schema_version: evaluation_key.circuit_version,
            correlation_id,
            key_id: evaluation_key.key_id,
            evaluation_key: evaluation_key.bytes.clone(),
            payload: ciphertexts.iter().map(|ct| ct.bytes.clone()).collect(),
        })
    }

    pub fn evaluation_key_blob(&self) -> EvaluationKeyBlob {
        EvaluationKeyBlob {
            circuit_version: self.schema_version,
            key_id: self.key_id,
            bytes: self.evaluation_key.clone(),
        }
    }

    pub fn ciphertexts(&self) -> Vec<Ciphertext> {
        stamp(self.schema_version, self.key_id, &self.payload)
    }
}

impl fmt::Debug for RequestEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestEnvelope")
            .field("schema_version", &self.schema_version)
            .field("correlation_id", &self.correlation_id)
            .field("key_id", &self.key_id)
            .field("evaluation_key_len", &self.evaluation_key.len())
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Evaluated ciphertexts for one request, in request order
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub schema_version: u32,
    pub correlation_id: u64,
    pub key_id: KeyId,
    #[serde(with = "base64_list")]
    pub payload: Vec<Vec<u8>>,
}

impl ResponseEnvelope {
    pub fn for_request(request: &RequestEnvelope, payload: Vec<Vec<u8>>) -> Self {
        Self {
            schema_version: request.schema_version,
            correlation_id: request.correlation_id,
            key_id: request.key_id,
            payload,
        }
    }

    /// Check that this response answers `request`
    pub fn check_answers(&self, request: &RequestEnvelope) -> Result<()> {
        if self.correlation_id != request.correlation_id {
            return Err(Error::Protocol(format!(
                "response correlation id {} does not match request {}",
                self.correlation_id, request.correlation_id
            )));
        }
        if self.schema_version != request.schema_version {
            return Err(Error::VersionMismatch {
                expected: request.schema_version,
                actual: self.schema_version,
            });
        }
        if self.key_id != request.key_id {
            return Err(Error::KeyMismatch {
                expected: request.key_id,
                actual: self.key_id,
            });
        }
        if self.payload.len() != request.payload.len() {
            return Err(Error::Protocol(format!(
                "response {} carries {} ciphertexts for {} inputs",
                self.correlation_id,
                self.payload.len(),
                request.payload.len()
            )));
        }
        Ok(())
    }

    pub fn ciphertexts(&self) -> Vec<Ciphertext> {
        stamp(self.schema_version, self.key_id, &self.payload)
    }
}

impl fmt::Debug for ResponseEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseEnvelope")
            .field("schema_version", &self.schema_version)
            .field("correlation_id", &self.correlation_id)
            .field("key_id", &self.key_id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Check that `response` answers `request`: correlation id, version, key id, length
pub fn validate_response(request: &RequestEnvelope, response: &ResponseEnvelope) -> Result<()> {
    response.check_answers(request)
}

fn stamp(circuit_version: u32, key_id: KeyId, payload: &[Vec<u8>]) -> Vec<Ciphertext> {
    payload
        .iter()
        .map(|bytes| Ciphertext {
            circuit_version,
            key_id,
            bytes: bytes.clone(),
        })
        .collect()
}
