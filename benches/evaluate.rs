use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use fhe_infer::engine::{PostProcessing, QuantizedModel, Quantizer};
use fhe_infer::{
    CircuitSpecs, Evaluator, FeatureVector, ServerCircuit, Session, SimulatedClient,
    SimulatedServer,
};

const INPUT_DIM: usize = 16;

fn linear_pair() -> (CircuitSpecs, ServerCircuit) {
    let specs = CircuitSpecs {
        circuit_version: 1,
        input_quantizers: vec![
            Quantizer {
                scale: 0.05,
                zero_point: 128,
                n_bits: 8,
            };
            INPUT_DIM
        ],
        output_quantizer: Quantizer {
            scale: 0.001,
            zero_point: 0,
            n_bits: 24,
        },
        post_processing: PostProcessing::Softmax,
        classes: vec![0, 1, 2],
    };
    let weights = (0..3)
        .map(|k| (0..INPUT_DIM).map(|i| ((i * 3 + k) % 7) as i64 - 3).collect())
        .collect();
    let circuit = ServerCircuit {
        circuit_version: 1,
        input_dim: INPUT_DIM,
        model: QuantizedModel::Linear {
            weights,
            bias: vec![10, -4, 0],
        },
    };
    (specs, circuit)
}

fn evaluate_benchmark(c: &mut Criterion) {
    let (specs, circuit) = linear_pair();
    let session = Session::open(Arc::new(SimulatedClient::new(specs).unwrap()), None).unwrap();
    let evaluator = Evaluator::new(Arc::new(SimulatedServer::new(circuit).unwrap()));

    let mut group = c.benchmark_group("evaluate");

    for batch in [1, 10, 100] {
        let rows: Vec<FeatureVector> = (0..batch)
            .map(|r| {
                FeatureVector::new((0..INPUT_DIM).map(|i| ((r + i) % 11) as f64 - 5.0).collect())
            })
            .collect();
        let request = session.request_envelope(1, &rows).unwrap();

        group.bench_with_input(
            BenchmarkId::new("encrypt", format!("{}_rows", batch)),
            &batch,
            |b, _| {
                b.iter(|| session.encrypt(&rows).unwrap());
            },
        );

        group.bench_with_input(
            BenchmarkId::new("server", format!("{}_rows", batch)),
            &batch,
            |b, _| {
                b.iter(|| evaluator.evaluate(&request).unwrap());
            },
        );

        let response = evaluator.evaluate(&request).unwrap();
        group.bench_with_input(
            BenchmarkId::new("decrypt", format!("{}_rows", batch)),
            &batch,
            |b, _| {
                b.iter(|| session.decrypt_response(&response).unwrap());
            },
        );
    }

    group.finish();
}

criterion_group!(benches, evaluate_benchmark);
criterion_main!(benches);
