//! Plaintext dataset files
//!
//! Feature files are headerless CSV, one row per vector. Ground-truth files
//! hold one integer label per line. A dataset is split into chunk files named
//! `{start}-{start + chunk_size}.csv`, one under `test_data/` and one with the
//! same name under `ground_truths/`.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, WriterBuilder};
use tracing::info;

use crate::codec::{FeatureVector, Prediction};
use crate::config::{GROUND_TRUTHS_DIR, TEST_DATA_DIR};
use crate::error::{Error, Result};
use crate::validation::GroundTruthLabel;

/// Parse headerless CSV feature rows
pub fn parse_features<R: Read>(reader: R) -> Result<Vec<FeatureVector>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let values = record
            .iter()
            .map(|field| {
                field.parse::<f64>().map_err(|e| {
                    Error::Encoding(format!("row {}: invalid number {:?}: {}", line + 1, field, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        rows.push(FeatureVector::new(values));
    }
    Ok(rows)
}

pub fn read_features(path: &Path) -> Result<Vec<FeatureVector>> {
    parse_features(fs::File::open(path)?)
}

pub fn write_features(path: &Path, rows: &[FeatureVector]) -> Result<()> {
    create_parent(path)?;
    let mut writer = WriterBuilder::new().has_headers(false).from_path(path)?;
    for row in rows {
        writer.write_record(row.as_slice().iter().map(|x| x.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

/// Read one label per line. Integral floats (`1.0`) are accepted.
pub fn read_labels(path: &Path) -> Result<Vec<GroundTruthLabel>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut labels = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let field = record.get(0).unwrap_or_default();
        labels.push(parse_label(field).ok_or_else(|| {
            Error::Encoding(format!(
                "{}: line {}: invalid label {:?}",
                path.display(),
                line + 1,
                field
            ))
        })?);
    }
    Ok(labels)
}

fn parse_label(field: &str) -> Option<GroundTruthLabel> {
    if let Ok(v) = field.parse::<i64>() {
        return Some(v);
    }
    let v = field.parse::<f64>().ok()?;
    (v.is_finite() && v.fract() == 0.0).then_some(v as i64)
}

pub fn write_labels(path: &Path, labels: &[GroundTruthLabel]) -> Result<()> {
    create_parent(path)?;
    let mut writer = WriterBuilder::new().has_headers(false).from_path(path)?;
    for label in labels {
        writer.write_record([label.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

/// Write predictions as `label,class_index,score_0,...` with a header row
pub fn write_predictions(path: &Path, predictions: &[Prediction]) -> Result<()> {
    create_parent(path)?;
    let mut writer = WriterBuilder::new().flexible(true).from_path(path)?;

    let width = predictions.iter().map(|p| p.scores.len()).max().unwrap_or(0);
    let mut header = vec!["label".to_string(), "class_index".to_string()];
    header.extend((0..width).map(|i| format!("score_{}", i)));
    writer.write_record(&header)?;

    for p in predictions {
        let mut record = vec![p.label.to_string(), p.class_index.to_string()];
        record.extend(p.scores.iter().map(|s| s.to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// File name of the chunk starting at row `start`
pub fn chunk_file_name(start: usize, chunk_size: usize) -> String {
    format!("{}-{}.csv", start, start + chunk_size)
}

/// Split a labelled dataset into chunk files under `root`; returns the file names
pub fn split_into_chunks(
    features: &[FeatureVector],
    labels: &[GroundTruthLabel],
    chunk_size: usize,
    root: &Path,
) -> Result<Vec<String>> {
    if features.len() != labels.len() {
        return Err(Error::LengthMismatch {
            predictions: features.len(),
            ground_truth: labels.len(),
        });
    }
    if chunk_size == 0 {
        return Err(Error::Encoding("chunk size must be at least 1".into()));
    }

    let test_dir = root.join(TEST_DATA_DIR);
    let truth_dir = root.join(GROUND_TRUTHS_DIR);

    let mut names = Vec::new();
    for (i, (rows, truths)) in features
        .chunks(chunk_size)
        .zip(labels.chunks(chunk_size))
        .enumerate()
    {
        let name = chunk_file_name(i * chunk_size, chunk_size);
        write_features(&test_dir.join(&name), rows)?;
        write_labels(&truth_dir.join(&name), truths)?;
        names.push(name);
    }

    info!(
        "Split {} rows into {} chunks under {}",
        features.len(),
        names.len(),
        root.display()
    );
    Ok(names)
}

/// `.csv` files in `dir`, ordered by their starting row
pub fn list_chunk_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "csv") {
            files.push(path);
        }
    }
    files.sort_by_key(|p| (chunk_start(p), p.clone()));
    Ok(files)
}

fn chunk_start(path: &Path) -> usize {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.split('-').next())
        .and_then(|s| s.parse().ok())
        .unwrap_or(usize::MAX)
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
