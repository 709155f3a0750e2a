//! Metric and threshold types shared by evaluation, the registry and monitoring.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether a definition predicts a continuous quantity or a class.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
    Regression,
    /// Binary classification; class labels are 0 and 1.
    Classification,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    /// Classification: exact matches. Regression: share within the relative tolerance.
    Accuracy,
    Rmse,
    Mae,
    R2,
    Precision,
    Recall,
    F1,
}

impl MetricName {
    /// Whether evaluation of `problem` ever produces this metric.
    pub fn applies_to(self, problem: ProblemKind) -> bool {
        match self {
            MetricName::Accuracy => true,
            MetricName::Rmse | MetricName::Mae | MetricName::R2 => problem == ProblemKind::Regression,
            MetricName::Precision | MetricName::Recall | MetricName::F1 => {
                problem == ProblemKind::Classification
            }
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricName::Accuracy => "accuracy",
            MetricName::Rmse => "rmse",
            MetricName::Mae => "mae",
            MetricName::R2 => "r2",
            MetricName::Precision => "precision",
            MetricName::Recall => "recall",
            MetricName::F1 => "f1",
        };
        f.write_str(s)
    }
}

/// Held-out (or live-window) metrics. Fields not applicable to the problem kind are `None`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub samples: usize,
    pub accuracy: f64,
    pub rmse: Option<f64>,
    pub mae: Option<f64>,
    pub r2: Option<f64>,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
}

impl Metrics {
    pub fn get(&self, name: MetricName) -> Option<f64> {
        match name {
            MetricName::Accuracy => Some(self.accuracy),
            MetricName::Rmse => self.rmse,
            MetricName::Mae => self.mae,
            MetricName::R2 => self.r2,
            MetricName::Precision => self.precision,
            MetricName::Recall => self.recall,
            MetricName::F1 => self.f1,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    AtLeast,
    AtMost,
}

/// "accuracy >= 0.80", "rmse <= 1500", ...
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromotionThreshold {
    pub metric: MetricName,
    pub comparison: Comparison,
    pub value: f64,
}

impl PromotionThreshold {
    pub fn at_least(metric: MetricName, value: f64) -> Self {
        Self {
            metric,
            comparison: Comparison::AtLeast,
            value,
        }
    }

    pub fn at_most(metric: MetricName, value: f64) -> Self {
        Self {
            metric,
            comparison: Comparison::AtMost,
            value,
        }
    }

    /// A metric the problem kind does not produce never meets the threshold.
    pub fn is_met(&self, metrics: &Metrics) -> bool {
        match metrics.get(self.metric) {
            Some(v) if v.is_finite() => match self.comparison {
                Comparison::AtLeast => v >= self.value,
                Comparison::AtMost => v <= self.value,
            },
            _ => false,
        }
    }
}

/// Outcome of evaluating a freshly trained artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub metrics: Metrics,
    pub passed: bool,
    /// Value of the threshold metric, `NaN` when the metric does not apply.
    pub observed: f64,
}
