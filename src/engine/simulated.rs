//! Simulation backend for the engine interface
//!
//! Quantized inputs are serialized and XOR-masked with a ChaCha20 stream keyed
//! by the client's 32-byte secret. Each ciphertext uses its own stream (the
//! nonce); results are masked further along the same stream so the output of
//! `run` is a deterministic function of (ciphertext, evaluation key).
//!
//! The evaluation key carries the secret seed, so the server can unmask the
//! inputs. This backend has no confidentiality against the server.

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::error::{engine_err, Error, Result};

use super::circuit::{CircuitSpecs, ServerCircuit};
use super::{ClientEngine, SecretKey, ServerEngine};

/// Stream position where result masking starts (in 32-bit words)
const OUTPUT_WORD_POS: u128 = 1 << 64;

const SEED_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Stage {
    Input,
    Output,
}

#[derive(Serialize, Deserialize)]
struct MaskedPayload {
    nonce: u64,
    stage: Stage,
    masked: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SimEvaluationKey {
    circuit_version: u32,
    seed: [u8; SEED_LEN],
}

fn apply_mask(seed: &[u8; SEED_LEN], nonce: u64, word_pos: u128, data: &mut [u8]) {
    let mut rng = ChaCha20Rng::from_seed(*seed);
    rng.set_stream(nonce);
    rng.set_word_pos(word_pos);
    let mut keystream = vec![0u8; data.len()];
    rng.fill_bytes(&mut keystream);
    for (byte, k) in data.iter_mut().zip(keystream) {
        *byte ^= k;
    }
}

fn seed_of(secret_key: &SecretKey) -> Result<[u8; SEED_LEN]> {
    secret_key.as_bytes().try_into().map_err(|_| {
        Error::KeyStore(format!(
            "simulated engine expects a {}-byte secret, got {} bytes",
            SEED_LEN,
            secret_key.as_bytes().len()
        ))
    })
}

/// Client half of the simulation backend
#[derive(Debug, Clone)]
pub struct SimulatedClient {
    specs: CircuitSpecs,
}

impl SimulatedClient {
    pub fn new(specs: CircuitSpecs) -> Result<Self> {
        specs
            .validate()
            .map_err(|e| Error::Serialization(format!("invalid client specs: {}", e)))?;
        Ok(Self { specs })
    }
}

impl ClientEngine for SimulatedClient {
    fn specs(&self) -> &CircuitSpecs {
        &self.specs
    }

    fn generate_keys(&self) -> Result<SecretKey> {
        let mut seed = [0u8; SEED_LEN];
        ChaCha20Rng::from_entropy().fill_bytes(&mut seed);
        Ok(SecretKey::from_bytes(seed.to_vec()))
    }

    fn get_serialized_evaluation_keys(&self, secret_key: &SecretKey) -> Result<Vec<u8>> {
        let key = SimEvaluationKey {
            circuit_version: self.specs.circuit_version,
            seed: seed_of(secret_key)?,
        };
        Ok(bincode::serialize(&key)?)
    }

    fn quantize_encrypt_serialize(&self, secret_key: &SecretKey, features: &[f64]) -> Result<Vec<u8>> {
        let seed = seed_of(secret_key)?;
        let quantized: Vec<i64> = features
            .iter()
            .zip(&self.specs.input_quantizers)
            .map(|(&x, q)| q.quantize(x))
            .collect();

        let nonce: u64 = rand::thread_rng().gen();
        let mut masked = bincode::serialize(&quantized)?;
        apply_mask(&seed, nonce, 0, &mut masked);

        Ok(bincode::serialize(&MaskedPayload {
            nonce,
            stage: Stage::Input,
            masked,
        })?)
    }

    fn deserialize_decrypt_dequantize(&self, secret_key: &SecretKey, ciphertext: &[u8]) -> Result<Vec<f64>> {
        let seed = seed_of(secret_key)?;
        let payload: MaskedPayload = bincode::deserialize(ciphertext)
            .map_err(|e| Error::Decryption(format!("malformed ciphertext: {}", e)))?;
        if payload.stage != Stage::Output {
            return Err(Error::Decryption(
                "ciphertext has not been evaluated by the server".into(),
            ));
        }

        let mut plain = payload.masked;
        apply_mask(&seed, payload.nonce, OUTPUT_WORD_POS, &mut plain);
        let outputs: Vec<i64> = bincode::deserialize(&plain)
            .map_err(|_| Error::Decryption("ciphertext does not decrypt under this key".into()))?;

        Ok(outputs
            .into_iter()
            .map(|q| self.specs.output_quantizer.dequantize(q))
            .collect())
    }
}

/// Server half of the simulation backend
#[derive(Debug, Clone)]
pub struct SimulatedServer {
    circuit: ServerCircuit,
}

impl SimulatedServer {
    pub fn new(circuit: ServerCircuit) -> Result<Self> {
        circuit
            .validate()
            .map_err(|e| Error::Serialization(format!("invalid server circuit: {}", e)))?;
        Ok(Self { circuit })
    }
}

impl ServerEngine for SimulatedServer {
    fn circuit_version(&self) -> u32 {
        self.circuit.circuit_version
    }

    fn input_dim(&self) -> usize {
        self.circuit.input_dim
    }

    fn run(&self, ciphertext: &[u8], evaluation_key: &[u8]) -> Result<Vec<u8>> {
        let key: SimEvaluationKey = bincode::deserialize(evaluation_key)
            .map_err(|e| engine_err!("malformed evaluation key: {}", e))?;
        if key.circuit_version != self.circuit.circuit_version {
            return Err(engine_err!(
                "evaluation key was generated for circuit version {}, engine runs version {}",
                key.circuit_version,
                self.circuit.circuit_version
            ));
        }

        let payload: MaskedPayload = bincode::deserialize(ciphertext)
            .map_err(|e| engine_err!("malformed ciphertext: {}", e))?;
        if payload.stage != Stage::Input {
            return Err(engine_err!("ciphertext was already evaluated"));
        }

        let mut plain = payload.masked;
        apply_mask(&key.seed, payload.nonce, 0, &mut plain);
        let inputs: Vec<i64> = bincode::deserialize(&plain)
            .map_err(|_| engine_err!("ciphertext was not produced under this evaluation key"))?;
        if inputs.len() != self.circuit.input_dim {
            return Err(engine_err!(
                "circuit expects {} inputs, ciphertext holds {}",
                self.circuit.input_dim,
                inputs.len()
            ));
        }

        let outputs = self.circuit.model.evaluate(&inputs)?;

        let mut masked = bincode::serialize(&outputs)?;
        apply_mask(&key.seed, payload.nonce, OUTPUT_WORD_POS, &mut masked);
        Ok(bincode::serialize(&MaskedPayload {
            nonce: payload.nonce,
            stage: Stage::Output,
            masked,
        })?)
    }
}
