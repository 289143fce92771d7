//! Configuration for clients and the batch orchestrator
//!
//! Defaults follow the reference deployment: ten rows per chunk, three
//! attempts per chunk, and the `keys/`, `test_data/`, `ground_truths/`,
//! `enc_test_data/` directory layout.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Directory holding the persisted key pair
pub const KEYS_DIR: &str = "keys";
/// Fixed file name of the serialized evaluation key inside `KEYS_DIR`
pub const EVALUATION_KEY_FILE: &str = "serialized_evaluation_keys.ekl";
/// Fixed file name of the private key inside `KEYS_DIR`
pub const PRIVATE_KEY_FILE: &str = "private_key.fhk";
/// Plaintext feature chunks
pub const TEST_DATA_DIR: &str = "test_data";
/// Plaintext labels, one file per feature chunk
pub const GROUND_TRUTHS_DIR: &str = "ground_truths";
/// One serialized ciphertext batch per feature chunk
pub const ENC_TEST_DATA_DIR: &str = "enc_test_data";

/// Retry policy for transport failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per chunk, including the first one
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles on every further attempt
    pub initial_backoff_ms: u64,
    /// Upper bound for a single backoff
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Backoff to wait after `attempt` failed attempts (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 2_000,
        }
    }
}

/// Chunking and concurrency for `Orchestrator::submit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Ciphertexts per request envelope
    pub chunk_size: usize,
    /// Chunk requests allowed in flight at the same time
    pub max_in_flight: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl OrchestratorConfig {
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.chunk_size == 0 {
            return Err("chunk_size must be at least 1");
        }
        if self.max_in_flight == 0 {
            return Err("max_in_flight must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1");
        }
        Ok(())
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            max_in_flight: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Client configuration, usually loaded from `client_config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the evaluation server
    pub server_url: String,
    /// Client circuit specs produced when the model was compiled
    pub client_specs: PathBuf,
    /// Where the key pair is persisted; `None` keeps keys in memory only
    pub key_dir: Option<PathBuf>,
    /// Per-request timeout for the HTTP transport
    pub request_timeout_secs: u64,
    pub orchestrator: OrchestratorConfig,
}

impl ClientConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let config: ClientConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_url.is_empty() {
            return Err(Error::Serialization("server_url must not be empty".into()));
        }
        self.orchestrator
            .validate()
            .map_err(|e| Error::Serialization(format!("invalid orchestrator config: {}", e)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:3000".to_string(),
            client_specs: PathBuf::from("fhe/client.json"),
            key_dir: Some(PathBuf::from(KEYS_DIR)),
            request_timeout_secs: 120,
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_valid() {
        assert!(OrchestratorConfig::default().validate().is_ok());
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let config = OrchestratorConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_load_partial_json_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"server_url": "http://example:9000", "orchestrator": {{"chunk_size": 5, "max_in_flight": 2}}}}"#
        )
        .unwrap();

        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.server_url, "http://example:9000");
        assert_eq!(config.orchestrator.chunk_size, 5);
        assert_eq!(config.orchestrator.retry, RetryPolicy::default());
        assert_eq!(config.request_timeout_secs, 120);
    }
}
