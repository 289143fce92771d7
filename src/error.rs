//! Error handling for the inference protocol
//!
//! Provides a single `Error` type shared by the client, the server and the
//! orchestrator. Variants map one-to-one onto the protocol's failure classes so
//! callers can decide between retrying, rejecting locally and aborting a batch.

use std::fmt;

use crate::keys::KeyId;

/// Protocol operation error
#[derive(Debug)]
pub enum Error {
    /// Input dimension disagrees with the compiled circuit
    ShapeMismatch { expected: usize, actual: usize },
    /// Malformed numeric input (NaN, infinite values, unparsable numbers)
    Encoding(String),
    /// Client and server (or key and circuit) disagree on the circuit version
    VersionMismatch { expected: u32, actual: u32 },
    /// Ciphertexts and evaluation key belong to different key pairs
    KeyMismatch { expected: KeyId, actual: KeyId },
    /// Ciphertext cannot be decrypted under the active key pair
    Decryption(String),
    /// The FHE engine rejected the request
    Engine(String),
    /// Network failure or timeout
    Transport(String),
    /// Peer answered with something that violates the envelope contract
    Protocol(String),
    /// Predictions and ground truth differ in length
    LengthMismatch { predictions: usize, ground_truth: usize },
    /// Keys were requested before `KeyManager::initialize`
    NotInitialized,
    /// Persisted key material is missing, truncated or inconsistent
    KeyStore(String),
    Io(std::io::Error),
    Serialization(String),
}

impl Error {
    /// Only transport failures are transient; everything else indicates bad
    /// input or a configuration problem.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ShapeMismatch { expected, actual } => write!(
                f,
                "shape mismatch: circuit expects {} features, got {}",
                expected, actual
            ),
            Error::Encoding(msg) => write!(f, "encoding error: {}", msg),
            Error::VersionMismatch { expected, actual } => write!(
                f,
                "version mismatch: expected circuit version {}, got {}",
                expected, actual
            ),
            Error::KeyMismatch { expected, actual } => write!(
                f,
                "key mismatch: expected key {}, got {}",
                expected, actual
            ),
            Error::Decryption(msg) => write!(f, "decryption error: {}", msg),
            Error::Engine(msg) => write!(f, "engine error: {}", msg),
            Error::Transport(msg) => write!(f, "transport error: {}", msg),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::LengthMismatch {
                predictions,
                ground_truth,
            } => write!(
                f,
                "length mismatch: {} predictions vs {} ground truth labels",
                predictions, ground_truth
            ),
            Error::NotInitialized => write!(f, "keys not initialized"),
            Error::KeyStore(msg) => write!(f, "key store error: {}", msg),
            Error::Io(err) => write!(f, "io error: {}", err),
            Error::Serialization(msg) => write!(f, "serialization error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Error::Encoding(err.to_string())
    }
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Create an `Error::Engine` with format string support
macro_rules! engine_err {
    ($($arg:tt)*) => {
        $crate::error::Error::Engine(format!($($arg)*))
    };
}

pub(crate) use engine_err;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_is_retryable() {
        assert!(Error::Transport("timeout".into()).is_retryable());
        assert!(!Error::Engine("bad key".into()).is_retryable());
        assert!(!Error::VersionMismatch {
            expected: 1,
            actual: 2
        }
        .is_retryable());
        assert!(!Error::NotInitialized.is_retryable());
    }

    #[test]
    fn test_version_mismatch_names_both_versions() {
        let msg = Error::VersionMismatch {
            expected: 3,
            actual: 4,
        }
        .to_string();
        assert!(msg.contains('3'));
        assert!(msg.contains('4'));
    }
}
