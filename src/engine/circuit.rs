//! Compiled circuit descriptions
//!
//! A compiled model is split in two artifacts:
//! - [`CircuitSpecs`] (`client.json`): what the client needs to quantize
//!   inputs and interpret outputs.
//! - [`ServerCircuit`] (`server.json`): the quantized model the server
//!   evaluates. It never contains quantization parameters of the inputs.
//!
//! Both carry the circuit version; keys and envelopes are bound to it.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{engine_err, Error, Result};

/// Affine fixed-point quantizer: q = clamp(round(x / scale) + zero_point)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantizer {
    pub scale: f64,
    pub zero_point: i64,
    /// Bit width of the quantized domain
    pub n_bits: u8,
}

impl Quantizer {
    /// Identity quantizer for integer-valued features
    pub fn integer(n_bits: u8) -> Self {
        Self {
            scale: 1.0,
            zero_point: 0,
            n_bits,
        }
    }

    pub fn max_value(&self) -> i64 {
        (1i64 << self.n_bits) - 1
    }

    pub fn quantize(&self, x: f64) -> i64 {
        let q = (x / self.scale).round() as i64 + self.zero_point;
        q.clamp(0, self.max_value())
    }

    pub fn dequantize(&self, q: i64) -> f64 {
        (q - self.zero_point) as f64 * self.scale
    }

    fn validate(&self) -> std::result::Result<(), &'static str> {
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err("quantizer scale must be finite and positive");
        }
        if self.n_bits == 0 || self.n_bits > 32 {
            return Err("quantizer n_bits must be in 1..=32");
        }
        Ok(())
    }
}

/// Output post-processing applied in the clear after decryption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostProcessing {
    /// Scores are already probabilities (tree ensembles)
    #[default]
    Identity,
    /// Binary classification: one logit becomes [1 - p, p]
    Sigmoid,
    /// Multi-class logits
    Softmax,
}

impl PostProcessing {
    pub fn apply(&self, scores: &[f64]) -> Vec<f64> {
        match self {
            PostProcessing::Identity => scores.to_vec(),
            PostProcessing::Sigmoid => {
                let sigmoid = |x: f64| 1.0 / (1.0 + (-x).exp());
                if scores.len() == 1 {
                    let p = sigmoid(scores[0]);
                    vec![1.0 - p, p]
                } else {
                    scores.iter().map(|&x| sigmoid(x)).collect()
                }
            }
            PostProcessing::Softmax => {
                let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let exps: Vec<f64> = scores.iter().map(|&x| (x - max).exp()).collect();
                let sum: f64 = exps.iter().sum();
                exps.into_iter().map(|e| e / sum).collect()
            }
        }
    }
}

/// Index of the largest score; ties resolve to the first index
pub fn argmax(scores: &[f64]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &s)| match best {
            Some((_, b)) if b >= s => best,
            _ => Some((i, s)),
        })
        .map(|(i, _)| i)
}

/// Client-side circuit description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSpecs {
    pub circuit_version: u32,
    /// One quantizer per input feature
    pub input_quantizers: Vec<Quantizer>,
    pub output_quantizer: Quantizer,
    #[serde(default)]
    pub post_processing: PostProcessing,
    /// Class label for each output index
    pub classes: Vec<i64>,
}

impl CircuitSpecs {
    pub fn input_dim(&self) -> usize {
        self.input_quantizers.len()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let specs: CircuitSpecs = serde_json::from_reader(BufReader::new(file))?;
        specs
            .validate()
            .map_err(|e| Error::Serialization(format!("invalid client specs: {}", e)))?;
        Ok(specs)
    }

    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.input_quantizers.is_empty() {
            return Err("circuit must have at least one input");
        }
        for q in &self.input_quantizers {
            q.validate()?;
        }
        self.output_quantizer.validate()?;
        if self.classes.is_empty() {
            return Err("classes must not be empty");
        }
        Ok(())
    }
}

/// Decision tree node in the quantized domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreeNode {
    /// Go left when `input[feature] <= threshold`
    Split {
        feature: usize,
        threshold: i64,
        left: usize,
        right: usize,
    },
    Leaf { scores: Vec<i64> },
}

/// Quantized model evaluated by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuantizedModel {
    /// Node 0 is the root
    DecisionTree { nodes: Vec<TreeNode> },
    /// One weight row and one bias per output
    Linear { weights: Vec<Vec<i64>>, bias: Vec<i64> },
}

impl QuantizedModel {
    pub fn evaluate(&self, inputs: &[i64]) -> Result<Vec<i64>> {
        match self {
            QuantizedModel::DecisionTree { nodes } => {
                let mut idx = 0;
                // A valid tree reaches a leaf in fewer steps than it has nodes.
                for _ in 0..=nodes.len() {
                    match nodes.get(idx) {
                        Some(TreeNode::Split {
                            feature,
                            threshold,
                            left,
                            right,
                        }) => {
                            let value = inputs
                                .get(*feature)
                                .ok_or_else(|| engine_err!("tree reads missing feature {}", feature))?;
                            idx = if value <= threshold { *left } else { *right };
                        }
                        Some(TreeNode::Leaf { scores }) => return Ok(scores.clone()),
                        None => return Err(engine_err!("tree node {} out of range", idx)),
                    }
                }
                Err(engine_err!("decision tree contains a cycle"))
            }
            QuantizedModel::Linear { weights, bias } => weights
                .iter()
                .zip(bias)
                .enumerate()
                .map(|(class, (row, b))| {
                    row.iter()
                        .zip(inputs)
                        .try_fold(*b, |acc, (w, x)| w.checked_mul(*x).and_then(|p| acc.checked_add(p)))
                        .ok_or_else(|| engine_err!("linear model overflow in score {}", class))
                })
                .collect(),
        }
    }

    fn validate(&self, input_dim: usize) -> std::result::Result<(), &'static str> {
        match self {
            QuantizedModel::DecisionTree { nodes } => {
                if nodes.is_empty() {
                    return Err("decision tree has no nodes");
                }
                let mut outputs = None;
                for node in nodes {
                    match node {
                        TreeNode::Split {
                            feature,
                            left,
                            right,
                            ..
                        } => {
                            if *feature >= input_dim {
                                return Err("split feature out of range");
                            }
                            if *left >= nodes.len() || *right >= nodes.len() {
                                return Err("child index out of range");
                            }
                        }
                        TreeNode::Leaf { scores } => match outputs {
                            None => outputs = Some(scores.len()),
                            Some(n) if n != scores.len() => {
                                return Err("leaves disagree on output size")
                            }
                            Some(_) => {}
                        },
                    }
                }
                if outputs.is_none() {
                    return Err("decision tree has no leaves");
                }
            }
            QuantizedModel::Linear { weights, bias } => {
                if weights.is_empty() || weights.len() != bias.len() {
                    return Err("linear model needs one bias per weight row");
                }
                if weights.iter().any(|row| row.len() != input_dim) {
                    return Err("weight row length must equal input_dim");
                }
            }
        }
        Ok(())
    }
}

/// Server-side compiled circuit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCircuit {
    pub circuit_version: u32,
    pub input_dim: usize,
    pub model: QuantizedModel,
}

impl ServerCircuit {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let circuit: ServerCircuit = serde_json::from_reader(BufReader::new(file))?;
        circuit
            .validate()
            .map_err(|e| Error::Serialization(format!("invalid server circuit: {}", e)))?;
        Ok(circuit)
    }

    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.input_dim == 0 {
            return Err("input_dim must be positive");
        }
        self.model.validate(self.input_dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stump() -> QuantizedModel {
        QuantizedModel::DecisionTree {
            nodes: vec![
                TreeNode::Split {
                    feature: 1,
                    threshold: 3,
                    left: 1,
                    right: 2,
                },
                TreeNode::Leaf { scores: vec![1, 0] },
                TreeNode::Leaf { scores: vec![0, 1] },
            ],
        }
    }

    #[test]
    fn test_quantizer_clamps_to_bit_width() {
        let q = Quantizer {
            scale: 0.5,
            zero_point: 2,
            n_bits: 4,
        };
        assert_eq!(q.quantize(1.0), 4);
        assert_eq!(q.quantize(-10.0), 0);
        assert_eq!(q.quantize(100.0), 15);
        assert_eq!(q.dequantize(4), 1.0);
    }

    #[test]
    fn test_tree_follows_threshold() {
        let model = stump();
        assert_eq!(model.evaluate(&[9, 3]).unwrap(), vec![1, 0]);
        assert_eq!(model.evaluate(&[0, 4]).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_tree_cycle_is_engine_error() {
        let model = QuantizedModel::DecisionTree {
            nodes: vec![TreeNode::Split {
                feature: 0,
                threshold: 0,
                left: 0,
                right: 0,
            }],
        };
        assert!(matches!(model.evaluate(&[1]), Err(Error::Engine(_))));
    }

    #[test]
    fn test_linear_scores() {
        let model = QuantizedModel::Linear {
            weights: vec![vec![1, 2], vec![-1, 0]],
            bias: vec![3, 5],
        };
        assert_eq!(model.evaluate(&[2, 4]).unwrap(), vec![13, 3]);
    }

    #[test]
    fn test_linear_overflow_is_engine_error() {
        let model = QuantizedModel::Linear {
            weights: vec![vec![2]],
            bias: vec![0],
        };
        assert!(matches!(model.evaluate(&[i64::MAX]), Err(Error::Engine(_))));

        let model = QuantizedModel::Linear {
            weights: vec![vec![1]],
            bias: vec![1],
        };
        assert!(matches!(model.evaluate(&[i64::MAX]), Err(Error::Engine(_))));
    }

    #[test]
    fn test_validate_rejects_bad_child() {
        let circuit = ServerCircuit {
            circuit_version: 1,
            input_dim: 2,
            model: QuantizedModel::DecisionTree {
                nodes: vec![TreeNode::Split {
                    feature: 0,
                    threshold: 1,
                    left: 1,
                    right: 7,
                }],
            },
        };
        assert!(circuit.validate().is_err());
    }

    #[test]
    fn test_post_processing_and_argmax() {
        let probs = PostProcessing::Sigmoid.apply(&[0.0]);
        assert_eq!(probs, vec![0.5, 0.5]);
        assert_eq!(argmax(&probs), Some(0));

        let soft = PostProcessing::Softmax.apply(&[1.0, 3.0, 2.0]);
        assert!((soft.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert_eq!(argmax(&soft), Some(1));

        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_model_json_shape() {
        let json = serde_json::to_value(stump()).unwrap();
        assert_eq!(json["kind"], "decision_tree");
        assert_eq!(json["nodes"][0]["type"], "split");
    }
}
