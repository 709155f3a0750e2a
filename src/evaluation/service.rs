//! Held-out evaluation and the pass/fail decision against a promotion threshold.
//!
//! Threshold logic lives here; the registry only applies the boolean it is given.

use crate::common::error::{EngineError, EngineResult};
use crate::data::domain::FeatureMatrix;
use crate::training::algorithms::Algorithm;

use super::domain::{Evaluation, Metrics, ProblemKind, PromotionThreshold};

/// Whether a single prediction counts as correct for accuracy purposes.
pub fn is_correct(predicted: f64, actual: f64, problem: ProblemKind, tolerance: f64) -> bool {
    match problem {
        ProblemKind::Classification => predicted.round() == actual.round(),
        ProblemKind::Regression => {
            (predicted - actual).abs() <= tolerance * actual.abs().max(1e-9)
        }
    }
}

/// Task-appropriate metrics for aligned prediction/target slices.
pub fn compute_metrics(
    predicted: &[f64],
    actual: &[f64],
    problem: ProblemKind,
    tolerance: f64,
) -> Metrics {
    let n = predicted.len().min(actual.len());
    if n == 0 {
        return Metrics::default();
    }
    let pairs = || predicted.iter().zip(actual.iter()).take(n);
    let correct = pairs()
        .filter(|(p, a)| is_correct(**p, **a, problem, tolerance))
        .count();
    let accuracy = correct as f64 / n as f64;

    match problem {
        ProblemKind::Regression => {
            let nf = n as f64;
            let sse: f64 = pairs().map(|(p, a)| (p - a).powi(2)).sum();
            let sae: f64 = pairs().map(|(p, a)| (p - a).abs()).sum();
            let mean = pairs().map(|(_, a)| *a).sum::<f64>() / nf;
            let sst: f64 = pairs().map(|(_, a)| (a - mean).powi(2)).sum();
            let r2 = if sst > 0.0 {
                1.0 - sse / sst
            } else if sse == 0.0 {
                1.0
            } else {
                0.0
            };
            Metrics {
                samples: n,
                accuracy,
                rmse: Some((sse / nf).sqrt()),
                mae: Some(sae / nf),
                r2: Some(r2),
                ..Metrics::default()
            }
        }
        ProblemKind::Classification => {
            let (mut tp, mut fp, mut fneg) = (0usize, 0usize, 0usize);
            for (p, a) in pairs() {
                match (p.round() == 1.0, a.round() == 1.0) {
                    (true, true) => tp += 1,
                    (true, false) => fp += 1,
                    (false, true) => fneg += 1,
                    (false, false) => {}
                }
            }
            let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
            let precision = ratio(tp, tp + fp);
            let recall = ratio(tp, tp + fneg);
            let f1 = if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            };
            Metrics {
                samples: n,
                accuracy,
                precision: Some(precision),
                recall: Some(recall),
                f1: Some(f1),
                ..Metrics::default()
            }
        }
    }
}

/// Score `artifact` on a held-out split never seen during fitting.
pub fn evaluate(
    algorithm: &dyn Algorithm,
    artifact: &[u8],
    held_out: &FeatureMatrix,
    targets: &[f64],
    problem: ProblemKind,
    tolerance: f64,
    threshold: &PromotionThreshold,
) -> EngineResult<Evaluation> {
    if held_out.is_empty() || held_out.len() != targets.len() {
        return Err(EngineError::permanent(format!(
            "held-out set has {} rows and {} targets",
            held_out.len(),
            targets.len()
        )));
    }
    let model = algorithm.load(artifact)?;
    let predicted = held_out
        .rows()
        .map(|row| model.predict(row).map(|out| out.value))
        .collect::<EngineResult<Vec<_>>>()?;
    let metrics = compute_metrics(&predicted, targets, problem, tolerance);
    let passed = threshold.is_met(&metrics);
    let observed = metrics.get(threshold.metric).unwrap_or(f64::NAN);
    Ok(Evaluation {
        metrics,
        passed,
        observed,
    })
}
