//! Live accuracy tracking: prediction records, outcome feedback and drift signals.

pub mod domain;
pub mod service;

pub use domain::{AccuracySummary, DriftSignal, PredictionRecord, Window};
pub use service::{Monitor, PredictionLog};
