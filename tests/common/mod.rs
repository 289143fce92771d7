#![allow(dead_code)]

use std::sync::Arc;

use fhe_infer::engine::{PostProcessing, QuantizedModel, Quantizer, TreeNode};
use fhe_infer::{
    CircuitSpecs, Evaluator, FeatureVector, ServerCircuit, Session, SimulatedClient,
    SimulatedServer,
};

pub const CIRCUIT_VERSION: u32 = 1;

/// Depth-2 decision tree over three features in 0..=15
///
/// ```text
///            x0 <= 7
///          /         \
///     x1 <= 3       x2 <= 10
///     /    \         /    \
///   c0     c1      c1     c0
/// ```
pub fn tree_circuit(version: u32) -> ServerCircuit {
    let split = |feature, threshold, left, right| TreeNode::Split {
        feature,
        threshold,
        left,
        right,
    };
    let leaf = |scores: [i64; 2]| TreeNode::Leaf {
        scores: scores.to_vec(),
    };
    ServerCircuit {
        circuit_version: version,
        input_dim: 3,
        model: QuantizedModel::DecisionTree {
            nodes: vec![
                split(0, 7, 1, 2),
                split(1, 3, 3, 4),
                split(2, 10, 5, 6),
                leaf([5, 1]),
                leaf([1, 4]),
                leaf([0, 9]),
                leaf([7, 2]),
            ],
        },
    }
}

pub fn tree_specs(version: u32) -> CircuitSpecs {
    CircuitSpecs {
        circuit_version: version,
        input_quantizers: vec![Quantizer::integer(4); 3],
        output_quantizer: Quantizer::integer(8),
        post_processing: PostProcessing::Identity,
        classes: vec![0, 1],
    }
}

/// The same tree evaluated on plaintext
pub fn plaintext_predict(x: &[f64]) -> i64 {
    if x[0] <= 7.0 {
        if x[1] <= 3.0 {
            0
        } else {
            1
        }
    } else if x[2] <= 10.0 {
        1
    } else {
        0
    }
}

/// Ten rows covering every leaf
pub fn ten_rows() -> Vec<FeatureVector> {
    [
        [0.0, 0.0, 0.0],
        [7.0, 3.0, 15.0],
        [7.0, 4.0, 0.0],
        [2.0, 15.0, 9.0],
        [8.0, 0.0, 10.0],
        [15.0, 9.0, 3.0],
        [8.0, 2.0, 11.0],
        [15.0, 15.0, 15.0],
        [5.0, 1.0, 12.0],
        [12.0, 6.0, 10.0],
    ]
    .iter()
    .map(|row| FeatureVector::new(row.to_vec()))
    .collect()
}

/// Deterministic pseudo-random rows in 0..=15
pub fn rows(n: usize) -> Vec<FeatureVector> {
    (0..n)
        .map(|i| {
            FeatureVector::new(vec![
                ((i * 7) % 16) as f64,
                ((i * 5 + 3) % 16) as f64,
                ((i * 11 + 1) % 16) as f64,
            ])
        })
        .collect()
}

pub fn labels(rows: &[FeatureVector]) -> Vec<i64> {
    rows.iter().map(|r| plaintext_predict(r.as_slice())).collect()
}

pub fn evaluator(version: u32) -> Arc<Evaluator> {
    let engine = SimulatedServer::new(tree_circuit(version)).expect("valid circuit");
    Arc::new(Evaluator::new(Arc::new(engine)))
}

pub fn session(version: u32) -> Session {
    let engine = SimulatedClient::new(tree_specs(version)).expect("valid specs");
    Session::open(Arc::new(engine), None).expect("session")
}
