//! FHE engine capability interface
//!
//! The protocol never reaches below these two traits. A client-side engine
//! owns quantization, encryption and decryption for one compiled circuit; a
//! server-side engine owns homomorphic evaluation of that circuit.
//!
//! # Backends
//!
//! - [`simulated`]: evaluates quantized circuits on ChaCha20-masked integers.
//!   Its evaluation key carries the masking seed, so it provides no
//!   confidentiality against the server. It drives the protocol end-to-end
//!   without an FHE library, the way a compiler's "simulate" mode does.
//!
//! A production backend wraps an FHE library behind the same traits.

pub mod circuit;
pub mod simulated;

use std::fmt;

use crate::error::Result;

pub use circuit::{CircuitSpecs, PostProcessing, QuantizedModel, Quantizer, ServerCircuit, TreeNode};
pub use simulated::{SimulatedClient, SimulatedServer};

/// Engine-specific private key material
///
/// Has no `Serialize` implementation: the only way to move it out of the
/// process is the key store, which writes it to local disk.
pub struct SecretKey(Vec<u8>);

impl SecretKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey({} bytes, redacted)", self.0.len())
    }
}

/// Client side of the engine: key generation, encryption, decryption
pub trait ClientEngine: Send + Sync {
    /// Client-side description of the compiled circuit
    fn specs(&self) -> &CircuitSpecs;

    /// Generate a fresh private key for this circuit
    fn generate_keys(&self) -> Result<SecretKey>;

    /// Derive the serialized evaluation key belonging to `secret_key`
    fn get_serialized_evaluation_keys(&self, secret_key: &SecretKey) -> Result<Vec<u8>>;

    /// Quantize `features` into the circuit's fixed-point domain and encrypt them
    fn quantize_encrypt_serialize(&self, secret_key: &SecretKey, features: &[f64]) -> Result<Vec<u8>>;

    /// Decrypt an evaluated ciphertext and map it back to real-valued outputs
    fn deserialize_decrypt_dequantize(&self, secret_key: &SecretKey, ciphertext: &[u8]) -> Result<Vec<f64>>;
}

/// Server side of the engine: homomorphic evaluation only
pub trait ServerEngine: Send + Sync {
    /// Version of the circuit this engine evaluates
    fn circuit_version(&self) -> u32;

    /// Number of features the circuit expects
    fn input_dim(&self) -> usize;

    /// Evaluate the circuit on one ciphertext.
    ///
    /// Must be a pure function of its inputs so that retries are safe.
    fn run(&self, ciphertext: &[u8], evaluation_key: &[u8]) -> Result<Vec<u8>>;
}
