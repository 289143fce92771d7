//! Session key lifecycle
//!
//! `Uninitialized → KeysGenerated → (KeysPersisted)`
//!
//! The private key lives in [`PrivateKeyHandle`], which implements neither
//! `Serialize` nor `Clone`; the only path to disk is the key directory, and
//! nothing in the crate puts it in an envelope. Rotation replaces the key pair
//! with one under a fresh [`KeyId`], so results computed under the previous
//! evaluation key no longer decode.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{EVALUATION_KEY_FILE, PRIVATE_KEY_FILE};
use crate::engine::{ClientEngine, SecretKey};
use crate::error::{Error, Result};
use crate::wire::file::{load_key_record, stage_key_record, KeyKind};
use crate::wire::EvaluationKeyBlob;

/// Identifier of a key pair, embedded in every ciphertext and envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(pub u64);

impl KeyId {
    pub fn random() -> Self {
        Self(ChaCha20Rng::from_entropy().next_u64())
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Opaque decryption capability; never leaves the client process
pub struct PrivateKeyHandle {
    key_id: KeyId,
    circuit_version: u32,
    secret: SecretKey,
}

impl PrivateKeyHandle {
    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    pub fn circuit_version(&self) -> u32 {
        self.circuit_version
    }

    pub(crate) fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

impl fmt::Debug for PrivateKeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKeyHandle")
            .field("key_id", &self.key_id)
            .field("circuit_version", &self.circuit_version)
            .finish_non_exhaustive()
    }
}

/// A session's private key and the evaluation key derived from it
#[derive(Debug)]
pub struct KeyPair {
    private: PrivateKeyHandle,
    evaluation: EvaluationKeyBlob,
}

impl KeyPair {
    pub fn key_id(&self) -> KeyId {
        self.private.key_id
    }

    pub fn circuit_version(&self) -> u32 {
        self.private.circuit_version
    }

    pub fn evaluation_key(&self) -> &EvaluationKeyBlob {
        &self.evaluation
    }

    pub(crate) fn private_key(&self) -> &PrivateKeyHandle {
        &self.private
    }
}

/// Lifecycle state of a [`KeyManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Uninitialized,
    KeysGenerated,
    KeysPersisted,
}

/// Owns the key pair of one session
pub struct KeyManager {
    engine: Arc<dyn ClientEngine>,
    key_dir: Option<PathBuf>,
    keys: Option<Arc<KeyPair>>,
    state: KeyState,
}

impl KeyManager {
    /// Keys are kept in memory only
    pub fn new(engine: Arc<dyn ClientEngine>) -> Self {
        Self {
            engine,
            key_dir: None,
            keys: None,
            state: KeyState::Uninitialized,
        }
    }

    /// Keys are loaded from, or persisted to, `key_dir`
    pub fn with_key_dir(engine: Arc<dyn ClientEngine>, key_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_dir: Some(key_dir.into()),
            ..Self::new(engine)
        }
    }

    pub fn state(&self) -> KeyState {
        self.state
    }

    pub fn engine(&self) -> &Arc<dyn ClientEngine> {
        &self.engine
    }

    /// Generate (or load persisted) keys. A no-op once keys exist.
    pub fn initialize(&mut self) -> Result<()> {
        if self.keys.is_some() {
            return Ok(());
        }

        if let Some(dir) = self.key_dir.clone() {
            if dir.join(PRIVATE_KEY_FILE).exists() {
                let keys = self.load_persisted(&dir)?;
                info!(
                    "Loaded persisted keys {} for circuit version {}",
                    keys.key_id(),
                    keys.circuit_version()
                );
                self.keys = Some(Arc::new(keys));
                self.state = KeyState::KeysPersisted;
                return Ok(());
            }
        }

        self.install_fresh_keys()
    }

    /// Replace the key pair with a new one under a fresh key id.
    /// On failure the previous pair stays active.
    pub fn rotate(&mut self) -> Result<()> {
        if let Some(old) = &self.keys {
            warn!(
                "Rotating keys: results bound to key {} will no longer decode",
                old.key_id()
            );
        }
        self.install_fresh_keys()
    }

    /// Serialized public evaluation key
    pub fn evaluation_key_blob(&self) -> Result<&EvaluationKeyBlob> {
        Ok(self.key_pair()?.evaluation_key())
    }

    pub fn key_id(&self) -> Option<KeyId> {
        self.keys.as_ref().map(|k| k.key_id())
    }

    pub(crate) fn private_key_handle(&self) -> Result<&PrivateKeyHandle> {
        Ok(self.key_pair()?.private_key())
    }

    pub(crate) fn key_pair(&self) -> Result<&Arc<KeyPair>> {
        self.keys.as_ref().ok_or(Error::NotInitialized)
    }

    fn install_fresh_keys(&mut self) -> Result<()> {
        let keys = self.generate()?;
        info!(
            "Generated keys {} for circuit version {}",
            keys.key_id(),
            keys.circuit_version()
        );

        let state = match &self.key_dir {
            Some(dir) => {
                persist(dir, &keys)?;
                info!("Persisted keys to {}", dir.display());
                KeyState::KeysPersisted
            }
            None => KeyState::KeysGenerated,
        };

        self.keys = Some(Arc::new(keys));
        self.state = state;
        Ok(())
    }

    fn generate(&self) -> Result<KeyPair> {
        let circuit_version = self.engine.specs().circuit_version;
        let key_id = KeyId::random();
        let secret = self.engine.generate_keys()?;
        let evaluation_bytes = self.engine.get_serialized_evaluation_keys(&secret)?;

        Ok(KeyPair {
            private: PrivateKeyHandle {
                key_id,
                circuit_version,
                secret,
            },
            evaluation: EvaluationKeyBlob {
                circuit_version,
                key_id,
                bytes: evaluation_bytes,
            },
        })
    }

    fn load_persisted(&self, dir: &Path) -> Result<KeyPair> {
        let private = load_key_record(&dir.join(PRIVATE_KEY_FILE), KeyKind::Private)?;
        let evaluation = load_key_record(&dir.join(EVALUATION_KEY_FILE), KeyKind::Evaluation)
            .map_err(|e| Error::KeyStore(format!("private key present but evaluation key unreadable: {}", e)))?;

        if private.key_id != evaluation.key_id {
            return Err(Error::KeyStore(format!(
                "private key {} and evaluation key {} do not belong together",
                private.key_id, evaluation.key_id
            )));
        }

        let active = self.engine.specs().circuit_version;
        if private.circuit_version != active {
            return Err(Error::VersionMismatch {
                expected: active,
                actual: private.circuit_version,
            });
        }

        Ok(KeyPair {
            private: PrivateKeyHandle {
                key_id: private.key_id,
                circuit_version: private.circuit_version,
                secret: SecretKey::from_bytes(private.bytes),
            },
            evaluation: EvaluationKeyBlob {
                circuit_version: evaluation.circuit_version,
                key_id: evaluation.key_id,
                bytes: evaluation.bytes,
            },
        })
    }
}

/// Stage both records before replacing either, so a failed write never
/// leaves a new private key next to an old evaluation key.
fn persist(dir: &Path, keys: &KeyPair) -> Result<()> {
    let private_path = dir.join(PRIVATE_KEY_FILE);
    let evaluation_path = dir.join(EVALUATION_KEY_FILE);

    let staged_private = stage_key_record(
        &private_path,
        KeyKind::Private,
        keys.circuit_version(),
        keys.key_id(),
        keys.private.secret.as_bytes(),
    )?;
    let staged_evaluation = stage_key_record(
        &evaluation_path,
        KeyKind::Evaluation,
        keys.circuit_version(),
        keys.key_id(),
        &keys.evaluation.bytes,
    )
    .map_err(|e| {
        let _ = fs::remove_file(&staged_private);
        e
    })?;

    // The private record is renamed last: `initialize` treats its presence
    // as "keys exist", and a mismatched pair is refused on load.
    fs::rename(&staged_evaluation, &evaluation_path)?;
    fs::rename(&staged_private, &private_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CircuitSpecs, PostProcessing, Quantizer, SimulatedClient};
    use tempfile::tempdir;

    fn engine(version: u32) -> Arc<dyn ClientEngine> {
        Arc::new(
            SimulatedClient::new(CircuitSpecs {
                circuit_version: version,
                input_quantizers: vec![Quantizer::integer(4); 3],
                output_quantizer: Quantizer::integer(4),
                post_processing: PostProcessing::Identity,
                classes: vec![0, 1],
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_evaluation_key_requires_initialize() {
        let manager = KeyManager::new(engine(1));
        assert_eq!(manager.state(), KeyState::Uninitialized);
        assert!(matches!(manager.evaluation_key_blob(), Err(Error::NotInitialized)));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let mut manager = KeyManager::new(engine(1));
        manager.initialize().unwrap();
        let first = manager.key_id().unwrap();
        manager.initialize().unwrap();

        assert_eq!(manager.key_id(), Some(first));
        assert_eq!(manager.state(), KeyState::KeysGenerated);
        assert_eq!(manager.evaluation_key_blob().unwrap().circuit_version, 1);
    }

    #[test]
    fn test_persisted_keys_are_reloaded() {
        let dir = tempdir().unwrap();

        let mut first = KeyManager::with_key_dir(engine(1), dir.path());
        first.initialize().unwrap();
        assert_eq!(first.state(), KeyState::KeysPersisted);
        assert!(dir.path().join(EVALUATION_KEY_FILE).exists());

        let mut second = KeyManager::with_key_dir(engine(1), dir.path());
        second.initialize().unwrap();

        assert_eq!(second.key_id(), first.key_id());
        assert_eq!(
            second.evaluation_key_blob().unwrap(),
            first.evaluation_key_blob().unwrap()
        );
    }

    #[test]
    fn test_persisted_keys_for_other_circuit_rejected() {
        let dir = tempdir().unwrap();
        KeyManager::with_key_dir(engine(1), dir.path())
            .initialize()
            .unwrap();

        let mut recompiled = KeyManager::with_key_dir(engine(2), dir.path());
        let err = recompiled.initialize().unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { expected: 2, actual: 1 }));

        recompiled.rotate().unwrap();
        assert_eq!(recompiled.evaluation_key_blob().unwrap().circuit_version, 2);
    }

    #[test]
    fn test_rotate_issues_new_key_id() {
        let mut manager = KeyManager::new(engine(1));
        manager.initialize().unwrap();
        let before = manager.key_id().unwrap();

        manager.rotate().unwrap();
        assert_ne!(manager.key_id().unwrap(), before);
    }

    #[test]
    fn test_failed_rotation_keeps_working_pair() {
        let root = tempdir().unwrap();
        let key_dir = root.path().join("keys");
        let mut manager = KeyManager::with_key_dir(engine(1), &key_dir);
        manager.initialize().unwrap();
        let before = manager.key_id().unwrap();
        let blob = manager.evaluation_key_blob().unwrap().clone();

        // The key directory becomes unwritable
        fs::remove_dir_all(&key_dir).unwrap();
        fs::write(&key_dir, b"not a directory").unwrap();

        assert!(manager.rotate().is_err());
        assert_eq!(manager.state(), KeyState::KeysPersisted);
        assert_eq!(manager.key_id(), Some(before));
        assert_eq!(manager.evaluation_key_blob().unwrap(), &blob);
        assert!(manager.private_key_handle().is_ok());
    }

    #[test]
    fn test_failed_first_persist_stays_uninitialized() {
        let root = tempdir().unwrap();
        let key_dir = root.path().join("keys");
        fs::write(&key_dir, b"not a directory").unwrap();

        let mut manager = KeyManager::with_key_dir(engine(1), &key_dir);
        assert!(manager.initialize().is_err());
        assert_eq!(manager.state(), KeyState::Uninitialized);
        assert_eq!(manager.key_id(), None);
        assert!(matches!(manager.evaluation_key_blob(), Err(Error::NotInitialized)));
    }

    #[test]
    fn test_rotation_replaces_both_records() {
        let dir = tempdir().unwrap();
        let mut manager = KeyManager::with_key_dir(engine(1), dir.path());
        manager.initialize().unwrap();
        manager.rotate().unwrap();
        let rotated = manager.key_id();

        let mut reloaded = KeyManager::with_key_dir(engine(1), dir.path());
        reloaded.initialize().unwrap();
        assert_eq!(reloaded.key_id(), rotated);
        assert!(!dir.path().join("private_key.fhk.tmp").exists());
        assert!(!dir.path().join("serialized_evaluation_keys.ekl.tmp").exists());
    }

    #[test]
    fn test_private_key_debug_is_redacted() {
        let mut manager = KeyManager::new(engine(1));
        manager.initialize().unwrap();
        let rendered = format!("{:?}", manager.private_key_handle().unwrap());
        assert!(rendered.contains("key_id"));
        assert!(!rendered.contains("secret"));
    }
}
