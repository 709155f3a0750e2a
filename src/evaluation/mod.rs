//! Evaluation and validation of trained artifacts against promotion thresholds.

pub mod domain;
pub mod service;

pub use domain::{Comparison, Evaluation, MetricName, Metrics, ProblemKind, PromotionThreshold};
pub use service::{compute_metrics, evaluate, is_correct};
