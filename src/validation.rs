//! Offline validation against plaintext ground truth
//!
//! The aggregate match rate is weighted by element count:
//! `total_matches / total_elements * 100`. A file with 2 rows counts for less
//! than a file with 10.

use std::fmt;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::config::{GROUND_TRUTHS_DIR, TEST_DATA_DIR};
use crate::codec::Prediction;
use crate::dataset::{list_chunk_files, read_features, read_labels};
use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;
use crate::session::Session;
use crate::transport::Transport;

/// Expected class label. Never leaves the client.
pub type GroundTruthLabel = i64;

/// Match count for one file (or one batch)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub name: String,
    pub matches: usize,
    pub total: usize,
}

impl FileReport {
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.matches as f64 / self.total as f64 * 100.0
    }
}

impl fmt::Display for FileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: Matches: {} | Success Percentage: {:.2}%",
            self.name,
            self.matches,
            self.percentage()
        )
    }
}

/// Per-file reports plus the weighted aggregate
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccuracyReport {
    pub files: Vec<FileReport>,
}

impl AccuracyReport {
    pub fn total_matches(&self) -> usize {
        self.files.iter().map(|f| f.matches).sum()
    }

    pub fn total_elements(&self) -> usize {
        self.files.iter().map(|f| f.total).sum()
    }

    /// Weighted match rate over all files, in percent
    pub fn percentage(&self) -> f64 {
        let total = self.total_elements();
        if total == 0 {
            return 0.0;
        }
        self.total_matches() as f64 / total as f64 * 100.0
    }
}

fn count_matches(
    name: &str,
    predictions: &[Prediction],
    ground_truth: &[GroundTruthLabel],
) -> Result<FileReport> {
    if predictions.len() != ground_truth.len() {
        return Err(Error::LengthMismatch {
            predictions: predictions.len(),
            ground_truth: ground_truth.len(),
        });
    }
    Ok(FileReport {
        name: name.to_string(),
        matches: predictions
            .iter()
            .zip(ground_truth)
            .filter(|(p, t)| p.label == **t)
            .count(),
        total: ground_truth.len(),
    })
}

/// Compare one batch of decoded predictions with its ground truth
pub fn compare(
    predictions: &[Prediction],
    ground_truth: &[GroundTruthLabel],
) -> Result<AccuracyReport> {
    Ok(AccuracyReport {
        files: vec![count_matches("batch", predictions, ground_truth)?],
    })
}

/// Accumulates per-file comparisons
#[derive(Debug, Default)]
pub struct ValidationHarness {
    report: AccuracyReport,
}

impl ValidationHarness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        name: &str,
        predictions: &[Prediction],
        ground_truth: &[GroundTruthLabel],
    ) -> Result<&FileReport> {
        let file = count_matches(name, predictions, ground_truth)?;
        info!("{}", file);
        self.report.files.push(file);
        Ok(&self.report.files[self.report.files.len() - 1])
    }

    pub fn report(&self) -> &AccuracyReport {
        &self.report
    }

    pub fn finish(self) -> AccuracyReport {
        info!(
            "Overall Success Percentage: {:.2}% ({} of {})",
            self.report.percentage(),
            self.report.total_matches(),
            self.report.total_elements()
        );
        self.report
    }
}

/// Run every `test_data/*.csv` under `root` through the full pipeline and
/// compare with `ground_truths/<same name>`
pub async fn validate_directory<T: Transport + 'static>(
    session: &Session,
    orchestrator: &Orchestrator<T>,
    root: &Path,
) -> Result<AccuracyReport> {
    let mut harness = ValidationHarness::new();

    for path in list_chunk_files(&root.join(TEST_DATA_DIR))? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
            continue;
        };
        let features = read_features(&path)?;
        let ground_truth = read_labels(&root.join(GROUND_TRUTHS_DIR).join(&name))?;

        let predictions = session
            .predict(orchestrator, &features)
            .await?
            .into_predictions()?;

        harness.record(&name, &predictions, &ground_truth)?;
    }

    Ok(harness.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predicted(labels: &[GroundTruthLabel]) -> Vec<Prediction> {
        labels
            .iter()
            .map(|&label| Prediction {
                label,
                class_index: label as usize,
                scores: Vec::new(),
            })
            .collect()
    }

    #[test]
    fn test_compare_counts_matches() {
        let report = compare(&predicted(&[1, 0, 1, 1]), &[1, 1, 1, 0]).unwrap();
        assert_eq!(report.total_matches(), 2);
        assert_eq!(report.percentage(), 50.0);
    }

    #[test]
    fn test_length_mismatch() {
        let err = compare(&predicted(&[1, 0]), &[1]).unwrap_err();
        assert!(matches!(
            err,
            Error::LengthMismatch {
                predictions: 2,
                ground_truth: 1
            }
        ));
    }

    #[test]
    fn test_aggregate_is_weighted() {
        let mut harness = ValidationHarness::new();
        // 10/10 and 0/2: weighted 10/12, not the mean of 100% and 0%
        harness.record("0-10.csv", &predicted(&[1; 10]), &[1; 10]).unwrap();
        let small = harness.record("10-20.csv", &predicted(&[0, 0]), &[1, 1]).unwrap();
        assert_eq!(small.percentage(), 0.0);

        let report = harness.finish();
        assert_eq!(report.files.len(), 2);
        assert!((report.percentage() - 1000.0 / 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_report() {
        assert_eq!(AccuracyReport::default().percentage(), 0.0);
    }
}
