//! Feature engineering: fitting frozen feature sets and applying them.
//!
//! Everything here is pure. Missing or garbage values are errors that name the
//! column and row; nothing is silently coerced to zero.

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::common::error::{DataError, EngineResult};

use super::domain::{
    FeatureMatrix, FeatureRule, FeatureSet, FittedRule, Record, RuleKind, RuleStats, Value,
};

fn cell<'a>(record: &'a Record, column: &str, row: usize) -> Result<&'a Value, DataError> {
    record.get(column).ok_or_else(|| DataError::MissingColumn {
        column: column.to_string(),
        row,
    })
}

fn numeric(record: &Record, column: &str, row: usize) -> Result<f64, DataError> {
    let value = cell(record, column, row)?;
    value.as_number().ok_or_else(|| DataError::InvalidValue {
        column: column.to_string(),
        row,
        value: value.to_string(),
    })
}

fn category(record: &Record, column: &str, row: usize) -> Result<String, DataError> {
    let value = cell(record, column, row)?;
    value.as_category().ok_or_else(|| DataError::InvalidValue {
        column: column.to_string(),
        row,
        value: value.to_string(),
    })
}

/// Compute and freeze normalisation/encoding statistics from a training corpus.
pub fn fit_feature_set(
    name: &str,
    revision: u32,
    records: &[Record],
    rules: &[FeatureRule],
) -> EngineResult<FeatureSet> {
    if rules.is_empty() {
        return Err(DataError::EmptyFeatureSet.into());
    }
    if records.is_empty() {
        return Err(DataError::InsufficientRows {
            required: 1,
            found: 0,
        }
        .into());
    }

    let mut fitted = Vec::with_capacity(rules.len());
    for rule in rules {
        let stats = match rule.kind {
            RuleKind::Raw | RuleKind::Log1p => {
                for (row, rec) in records.iter().enumerate() {
                    apply_scalar(rule, &RuleStats::None, numeric(rec, &rule.source, row)?, row)?;
                }
                RuleStats::None
            }
            RuleKind::Standardize => {
                let xs = column_values(records, &rule.source)?;
                let n = xs.len() as f64;
                let mean = xs.iter().sum::<f64>() / n;
                let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
                let std = var.sqrt();
                RuleStats::Standardize {
                    mean,
                    std: if std > f64::EPSILON { std } else { 1.0 },
                }
            }
            RuleKind::MinMax => {
                let xs = column_values(records, &rule.source)?;
                let min = xs.iter().copied().fold(f64::INFINITY, f64::min);
                let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                RuleStats::MinMax { min, max }
            }
            RuleKind::OneHot => {
                let mut vocab = BTreeSet::new();
                for (row, rec) in records.iter().enumerate() {
                    vocab.insert(category(rec, &rule.source, row)?);
                }
                RuleStats::Vocabulary {
                    categories: vocab.into_iter().collect(),
                }
            }
        };
        fitted.push(FittedRule {
            rule: rule.clone(),
            stats,
        });
    }

    Ok(FeatureSet {
        name: name.to_string(),
        revision,
        rules: fitted,
        fitted_rows: records.len(),
    })
}

fn column_values(records: &[Record], column: &str) -> Result<Vec<f64>, DataError> {
    records
        .iter()
        .enumerate()
        .map(|(row, rec)| numeric(rec, column, row))
        .collect()
}

fn apply_scalar(rule: &FeatureRule, stats: &RuleStats, x: f64, row: usize) -> Result<f64, DataError> {
    Ok(match (rule.kind, stats) {
        (RuleKind::Log1p, _) => {
            if x <= -1.0 {
                return Err(DataError::InvalidValue {
                    column: rule.source.clone(),
                    row,
                    value: x.to_string(),
                });
            }
            x.ln_1p()
        }
        (RuleKind::Standardize, RuleStats::Standardize { mean, std }) => (x - mean) / std,
        (RuleKind::MinMax, RuleStats::MinMax { min, max }) => {
            let range = max - min;
            if range > f64::EPSILON {
                (x - min) / range
            } else {
                0.0
            }
        }
        _ => x,
    })
}

/// Engineer one record into `out` using frozen statistics.
pub fn build_row(
    record: &Record,
    feature_set: &FeatureSet,
    row: usize,
    out: &mut Vec<f64>,
) -> Result<(), DataError> {
    for fitted in &feature_set.rules {
        let rule = &fitted.rule;
        match &fitted.stats {
            RuleStats::Vocabulary { categories } => {
                let label = category(record, &rule.source, row)?;
                let hit = categories.binary_search(&label).ok();
                for idx in 0..categories.len() {
                    out.push(if hit == Some(idx) { 1.0 } else { 0.0 });
                }
                out.push(if hit.is_none() { 1.0 } else { 0.0 });
            }
            stats => {
                let x = numeric(record, &rule.source, row)?;
                out.push(apply_scalar(rule, stats, x, row)?);
            }
        }
    }
    Ok(())
}

/// Apply a fitted feature set to records. Deterministic and side-effect free.
pub fn build_features(records: &[Record], feature_set: &FeatureSet) -> EngineResult<FeatureMatrix> {
    let mut matrix = FeatureMatrix::new(feature_set.output_columns());
    let mut row_buf = Vec::with_capacity(matrix.width());
    for (row, rec) in records.iter().enumerate() {
        row_buf.clear();
        build_row(rec, feature_set, row, &mut row_buf)?;
        matrix.push_row(&row_buf);
    }
    Ok(matrix)
}

/// Numeric target column, with the same strictness as features.
pub fn extract_targets(records: &[Record], column: &str) -> EngineResult<Vec<f64>> {
    Ok(column_values(records, column)?)
}

/// Deterministic shuffled split into (train, held-out) row indices.
///
/// The held-out side always gets at least one row and the training side keeps at least one.
pub fn split_holdout(rows: usize, fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut idx: Vec<usize> = (0..rows).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    idx.shuffle(&mut rng);
    let held = ((rows as f64) * fraction).round() as usize;
    let held = held.clamp(1.min(rows), rows.saturating_sub(1).max(1.min(rows)));
    let train = idx.split_off(held);
    (train, idx)
}

pub fn select(records: &[Record], idx: &[usize]) -> Vec<Record> {
    idx.iter().map(|&i| records[i].clone()).collect()
}

/// Bootstrap synthetic rows from a real snapshot until it has `target_rows`.
///
/// Numeric cells get ±5% jitter. This is an explicit opt-in; every call is logged at `warn`.
pub fn augment_with_samples(records: &[Record], target_rows: usize, seed: u64) -> Vec<Record> {
    let mut out = records.to_vec();
    if records.is_empty() || records.len() >= target_rows {
        return out;
    }
    warn!(
        real_rows = records.len(),
        target_rows,
        "augmenting training snapshot with synthetic sample rows"
    );
    let mut rng = StdRng::seed_from_u64(seed);
    while out.len() < target_rows {
        let mut sample = records[rng.random_range(0..records.len())].clone();
        for (_, value) in sample.iter_mut() {
            if let Value::Number(n) = value {
                *n *= 1.0 + rng.random_range(-0.05..0.05);
            }
        }
        out.push(sample);
    }
    out
}
