//! Prediction records and the summaries derived from them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::ids::{DefinitionId, Fingerprint, PredictionId, VersionId};

/// One served prediction. `ground_truth` is filled in at most once, later.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: PredictionId,
    pub definition_id: DefinitionId,
    pub version_id: VersionId,
    pub fingerprint: Fingerprint,
    pub value: f64,
    pub confidence: f64,
    pub served_from_cache: bool,
    pub created_ms: u64,
    pub ground_truth: Option<f64>,
    pub outcome_ms: Option<u64>,
}

/// Which records an accuracy summary covers.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Window {
    /// The most recent `n` records that have an outcome.
    Last(usize),
    /// Records created within this duration of now that have an outcome.
    Since(Duration),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccuracySummary {
    pub definition_id: DefinitionId,
    /// Version the summary was restricted to; `None` covers every version.
    pub version_id: Option<VersionId>,
    pub samples: usize,
    pub correct: usize,
    /// `None` when there are no samples.
    pub accuracy: Option<f64>,
    pub mean_absolute_error: Option<f64>,
}

/// Advisory drift verdict. Never triggers retraining on its own.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriftSignal {
    pub definition_id: DefinitionId,
    pub version_id: VersionId,
    pub drifted: bool,
    pub baseline_accuracy: f64,
    pub observed_accuracy: Option<f64>,
    pub allowed_delta: f64,
    pub samples: usize,
    /// Not enough outcomes yet to judge.
    pub insufficient_samples: bool,
}
