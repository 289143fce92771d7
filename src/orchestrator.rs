//! Batch orchestration
//!
//! A dataset of ciphertexts is split into chunks of `chunk_size`; each chunk
//! becomes one [`RequestEnvelope`] and one round trip. Up to `max_in_flight`
//! round trips run concurrently and may complete in any order. Results are
//! put back in place by correlation id, so `outputs[i]` always answers input
//! `i`.
//!
//! Transport failures are retried with exponential backoff. A chunk that
//! exhausts its attempts is reported in [`BatchOutcome::failures`] while the
//! other chunks carry on. Any other failure (version, engine, key, protocol)
//! would fail every chunk the same way, so it aborts the whole batch.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{OrchestratorConfig, RetryPolicy};
use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::wire::{validate_response, Ciphertext, EvaluationKeyBlob, RequestEnvelope};

/// A chunk that could not be evaluated after all retries
#[derive(Debug)]
pub struct ChunkFailure {
    pub chunk: usize,
    /// Input indices covered by the chunk
    pub indices: Range<usize>,
    pub attempts: u32,
    pub error: Error,
}

impl fmt::Display for ChunkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chunk {} (inputs {}..{}) failed after {} attempt(s): {}",
            self.chunk, self.indices.start, self.indices.end, self.attempts, self.error
        )
    }
}

/// Result of [`Orchestrator::submit`]
#[derive(Debug)]
pub struct BatchOutcome {
    /// One slot per input, in input order; `None` where the chunk failed
    pub outputs: Vec<Option<Ciphertext>>,
    pub failures: Vec<ChunkFailure>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Input indices without a result, ascending
    pub fn failed_indices(&self) -> Vec<usize> {
        self.outputs
            .iter()
            .enumerate()
            .filter(|(_, o)| o.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    /// All outputs, or the first chunk failure
    pub fn into_complete(self) -> Result<Vec<Ciphertext>> {
        if let Some(failure) = self.failures.into_iter().next() {
            return Err(failure.error);
        }
        self.outputs
            .into_iter()
            .map(|o| o.ok_or_else(|| Error::Protocol("missing output".into())))
            .collect()
    }
}

enum ChunkResult {
    Done {
        correlation_id: u64,
        outputs: Vec<Ciphertext>,
    },
    Exhausted(ChunkFailure),
}

/// Drives chunked evaluation over a [`Transport`]
pub struct Orchestrator<T> {
    transport: Arc<T>,
    config: OrchestratorConfig,
}

impl<T: Transport + 'static> Orchestrator<T> {
    pub fn new(transport: Arc<T>, config: OrchestratorConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Serialization(format!("invalid orchestrator config: {}", e)))?;
        Ok(Self { transport, config })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Evaluate `ciphertexts` under `evaluation_key`, preserving input order
    pub async fn submit(
        &self,
        evaluation_key: &EvaluationKeyBlob,
        ciphertexts: Vec<Ciphertext>,
    ) -> Result<BatchOutcome> {
        let total = ciphertexts.len();
        let chunk_size = self.config.chunk_size;
        let base: u64 = rand::thread_rng().gen::<u32>() as u64;

        let mut ranges: HashMap<u64, Range<usize>> = HashMap::new();
        let mut requests = Vec::new();
        for (chunk, items) in ciphertexts.chunks(chunk_size).enumerate() {
            let correlation_id = base + chunk as u64;
            let start = chunk * chunk_size;
            ranges.insert(correlation_id, start..start + items.len());
            requests.push((
                chunk,
                start..start + items.len(),
                RequestEnvelope::new(correlation_id, evaluation_key, items)?,
            ));
        }
        drop(ciphertexts);

        info!(
            "Submitting {} ciphertexts in {} chunks ({} in flight)",
            total,
            requests.len(),
            self.config.max_in_flight
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_in_flight));
        let mut tasks = JoinSet::new();
        for (chunk, indices, request) in requests {
            let transport = self.transport.clone();
            let semaphore = semaphore.clone();
            let retry = self.config.retry.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Protocol("orchestrator shut down".into()))?;
                run_chunk(transport.as_ref(), chunk, indices, request, &retry).await
            });
        }

        let mut outputs: Vec<Option<Ciphertext>> = vec![None; total];
        let mut failures = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(Error::Protocol(format!("chunk task failed: {}", e))),
            };

            match result {
                Ok(ChunkResult::Done {
                    correlation_id,
                    outputs: evaluated,
                }) => {
                    let range = ranges.get(&correlation_id).ok_or_else(|| {
                        Error::Protocol(format!("unknown correlation id {}", correlation_id))
                    })?;
                    for (slot, ct) in outputs[range.clone()].iter_mut().zip(evaluated) {
                        *slot = Some(ct);
                    }
                }
                Ok(ChunkResult::Exhausted(failure)) => {
                    warn!(
                        "Chunk {} (inputs {:?}) failed after {} attempts: {}",
                        failure.chunk, failure.indices, failure.attempts, failure.error
                    );
                    failures.push(failure);
                }
                Err(e) => {
                    error!("Aborting batch: {}", e);
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        failures.sort_by_key(|f| f.chunk);
        info!(
            "Batch finished: {} of {} chunks succeeded",
            ranges.len() - failures.len(),
            ranges.len()
        );
        Ok(BatchOutcome { outputs, failures })
    }
}

async fn run_chunk<T: Transport>(
    transport: &T,
    chunk: usize,
    indices: Range<usize>,
    request: RequestEnvelope,
    retry: &RetryPolicy,
) -> Result<ChunkResult> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let response = transport.evaluate(request.clone()).await;
        match response {
            Ok(response) => {
                validate_response(&request, &response)?;
                return Ok(ChunkResult::Done {
                    correlation_id: request.correlation_id,
                    outputs: response.ciphertexts(),
                });
            }
            Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                let backoff = retry.backoff(attempt);
                warn!(
                    "Chunk {} attempt {}/{} failed: {}; retrying in {:?}",
                    chunk, attempt, retry.max_attempts, e, backoff
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) if e.is_retryable() => {
                return Ok(ChunkResult::Exhausted(ChunkFailure {
                    chunk,
                    indices,
                    attempts: attempt,
                    error: e,
                }));
            }
            Err(e) => return Err(e),
        }
    }
}
