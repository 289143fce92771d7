//! In-process transport: evaluates requests on the blocking thread pool

use std::future::Future;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::evaluator::Evaluator;
use crate::wire::{RequestEnvelope, ResponseEnvelope};

use super::Transport;

#[derive(Clone)]
pub struct LocalTransport {
    evaluator: Arc<Evaluator>,
}

impl LocalTransport {
    pub fn new(evaluator: Arc<Evaluator>) -> Self {
        Self { evaluator }
    }

    pub fn evaluator(&self) -> &Arc<Evaluator> {
        &self.evaluator
    }
}

impl Transport for LocalTransport {
    fn evaluate(
        &self,
        request: RequestEnvelope,
    ) -> impl Future<Output = Result<ResponseEnvelope>> + Send {
        let evaluator = self.evaluator.clone();
        async move {
            tokio::task::spawn_blocking(move || evaluator.evaluate(&request))
                .await
                .map_err(|e| Error::Engine(format!("evaluation task failed: {}", e)))?
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{QuantizedModel, ServerCircuit, SimulatedServer};
    use crate::keys::KeyId;

    #[tokio::test]
    async fn test_local_transport_applies_version_gate() {
        let circuit = ServerCircuit {
            circuit_version: 5,
            input_dim: 1,
            model: QuantizedModel::Linear {
                weights: vec![vec![1]],
                bias: vec![0],
            },
        };
        let evaluator = Evaluator::new(Arc::new(SimulatedServer::new(circuit).unwrap()));
        let transport = LocalTransport::new(Arc::new(evaluator));

        let request = RequestEnvelope {
            schema_version: 4,
            correlation_id: 1,
            key_id: KeyId(1),
            evaluation_key: vec![],
            payload: vec![],
        };
        let err = transport.evaluate(request).await.unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { expected: 5, actual: 4 }));
    }
}
