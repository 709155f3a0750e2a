//! Domain types for model definitions, versions and training jobs.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::common::error::EngineResult;
use crate::common::ids::{DefinitionId, FeatureSetId, JobId, PredictionId, VersionId};
use crate::data::domain::{FeatureRule, FeatureSet};
use crate::evaluation::domain::{Metrics, ProblemKind, PromotionThreshold};
use crate::monitoring::domain::PredictionRecord;

/// Business task a definition predicts ("cost", "timeline", "risk", ...). Open-ended.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Named numeric hyperparameters, ordered for stable serialisation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hyperparameters(BTreeMap<String, f64>);

impl Hyperparameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn get_or(&self, key: &str, default: f64) -> f64 {
        self.get(key).unwrap_or(default)
    }

    /// `overrides` wins key by key.
    pub fn merged(&self, overrides: &Hyperparameters) -> Hyperparameters {
        let mut out = self.0.clone();
        out.extend(overrides.0.iter().map(|(k, v)| (k.clone(), *v)));
        Hyperparameters(out)
    }
}

/// Operator request describing a model family.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DefinitionSpec {
    pub name: String,
    pub task: TaskType,
    pub problem: ProblemKind,
    pub features: Vec<FeatureRule>,
    pub target_column: String,
    pub algorithm: String,
    #[serde(default)]
    pub hyperparameters: Hyperparameters,
    pub threshold: PromotionThreshold,
    /// Relative error counted as "correct" for regression accuracy.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Allowed drop of live accuracy below the accuracy recorded at promotion.
    #[serde(default = "default_drift_delta")]
    pub drift_delta: f64,
    /// Per-job budget; falls back to the engine-wide budget.
    #[serde(default)]
    pub max_training_secs: Option<u64>,
}

fn default_tolerance() -> f64 {
    0.10
}

fn default_drift_delta() -> f64 {
    0.10
}

impl DefinitionSpec {
    pub fn new(
        name: impl Into<String>,
        task: TaskType,
        problem: ProblemKind,
        features: Vec<FeatureRule>,
        target_column: impl Into<String>,
        algorithm: impl Into<String>,
        threshold: PromotionThreshold,
    ) -> Self {
        Self {
            name: name.into(),
            task,
            problem,
            features,
            target_column: target_column.into(),
            algorithm: algorithm.into(),
            hyperparameters: Hyperparameters::new(),
            threshold,
            tolerance: default_tolerance(),
            drift_delta: default_drift_delta(),
            max_training_secs: None,
        }
    }
}

/// Registered identity of a model family.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub id: DefinitionId,
    #[serde(flatten)]
    pub spec: DefinitionSpec,
    pub created_ms: u64,
}

impl ModelDefinition {
    pub fn feature_columns(&self) -> Vec<&str> {
        self.spec.features.iter().map(|r| r.source.as_str()).collect()
    }
}

/// Lifecycle of a model version.
///
/// `draft → training → {validated | failed | rejected}`, `validated → {active | rejected}`,
/// `active → deprecated`. `failed`, `rejected` and `deprecated` are terminal.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Draft,
    Training,
    Validated,
    Failed,
    Rejected,
    Active,
    Deprecated,
}

impl VersionStatus {
    pub fn can_transition_to(self, next: VersionStatus) -> bool {
        use VersionStatus::*;
        matches!(
            (self, next),
            (Draft, Training)
                | (Training, Validated)
                | (Training, Failed)
                | (Training, Rejected)
                | (Validated, Active)
                | (Validated, Rejected)
                | (Active, Deprecated)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            VersionStatus::Failed | VersionStatus::Rejected | VersionStatus::Deprecated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VersionStatus::Draft => "draft",
            VersionStatus::Training => "training",
            VersionStatus::Validated => "validated",
            VersionStatus::Failed => "failed",
            VersionStatus::Rejected => "rejected",
            VersionStatus::Active => "active",
            VersionStatus::Deprecated => "deprecated",
        }
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One trained (or training) artifact of a definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub id: VersionId,
    pub definition_id: DefinitionId,
    pub version: u32,
    pub status: VersionStatus,
    /// Opaque payload owned by the algorithm; persisted beside the row, not inside it.
    #[serde(skip)]
    pub artifact: Option<Arc<Vec<u8>>>,
    pub metrics: Option<Metrics>,
    pub feature_set_id: Option<FeatureSetId>,
    pub feature_set_checksum: Option<u64>,
    pub training_rows: usize,
    pub created_ms: u64,
    pub trained_ms: Option<u64>,
    pub training_duration_ms: Option<u64>,
    /// Accuracy at promotion time; the drift baseline.
    pub promoted_accuracy: Option<f64>,
    pub promoted_ms: Option<u64>,
    pub last_error: Option<String>,
}

/// Everything the orchestrator hands to the registry when training finishes.
#[derive(Clone, Debug)]
pub struct TrainingResult {
    pub metrics: Metrics,
    pub passed: bool,
    /// Why the threshold was missed; stored as the version's `last_error`.
    pub rejection: Option<String>,
    pub artifact: Vec<u8>,
    pub feature_set_id: FeatureSetId,
    pub feature_set_checksum: u64,
    pub training_rows: usize,
    pub duration_ms: u64,
}

/// Lifecycle of a training job. `succeeded`, `failed` and `cancelled` are terminal.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// A submitted unit of work. Retries are new jobs pointing at the same version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingJob {
    pub id: JobId,
    pub definition_id: DefinitionId,
    pub version_id: VersionId,
    pub hyperparameters: Hyperparameters,
    pub status: JobStatus,
    /// 1 for the first attempt on a version.
    pub attempt: u32,
    pub retry_of: Option<JobId>,
    pub worker: Option<usize>,
    pub submitted_ms: u64,
    pub started_ms: Option<u64>,
    pub finished_ms: Option<u64>,
    pub last_error: Option<String>,
}

/// Feature set as stored: bound to the version that fitted it, with its checksum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredFeatureSet {
    pub id: FeatureSetId,
    pub definition_id: DefinitionId,
    pub checksum: u64,
    pub feature_set: FeatureSet,
}

/// Everything a repository returns on startup.
#[derive(Clone, Debug, Default)]
pub struct RepoSnapshot {
    pub definitions: Vec<ModelDefinition>,
    pub versions: Vec<ModelVersion>,
    pub jobs: Vec<TrainingJob>,
    pub feature_sets: Vec<StoredFeatureSet>,
    pub predictions: Vec<PredictionRecord>,
}

/// Durable storage for the engine's five tables.
///
/// Writes are whole-row upserts; the in-memory registry is the consistency boundary
/// and writes through after each committed change.
pub trait RegistryRepo: Send + Sync {
    fn put_definition(&self, definition: &ModelDefinition) -> EngineResult<()>;
    fn put_version(&self, version: &ModelVersion) -> EngineResult<()>;
    /// Write several version rows as one unit: afterwards all of them are durable or
    /// none are. Promotion relies on this to swap the active version.
    fn put_versions(&self, versions: &[ModelVersion]) -> EngineResult<()>;
    fn put_job(&self, job: &TrainingJob) -> EngineResult<()>;
    fn put_feature_set(&self, feature_set: &StoredFeatureSet) -> EngineResult<()>;
    fn put_prediction(&self, record: &PredictionRecord) -> EngineResult<()>;
    fn remove_prediction(&self, id: PredictionId) -> EngineResult<()>;
    fn load(&self) -> EngineResult<RepoSnapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_edges() {
        use VersionStatus::*;
        assert!(Draft.can_transition_to(Training));
        assert!(Training.can_transition_to(Validated));
        assert!(Training.can_transition_to(Rejected));
        assert!(Validated.can_transition_to(Active));
        assert!(Active.can_transition_to(Deprecated));
        assert!(!Training.can_transition_to(Active));
        assert!(!Failed.can_transition_to(Training));
        assert!(!Deprecated.can_transition_to(Active));
        assert!(!Rejected.can_transition_to(Validated));
        for s in [Failed, Rejected, Deprecated] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn hyperparameter_overrides_win() {
        let base = Hyperparameters::new().with("epochs", 100.0).with("lr", 0.1);
        let merged = base.merged(&Hyperparameters::new().with("lr", 0.01));
        assert_eq!(merged.get("epochs"), Some(100.0));
        assert_eq!(merged.get("lr"), Some(0.01));
    }

    #[test]
    fn definition_spec_defaults_from_json() {
        let raw = r#"{
            "name": "cost_v1",
            "task": "cost",
            "problem": "regression",
            "features": [{"source": "budget", "feature": "budget", "kind": "standardize"}],
            "target_column": "final_cost",
            "algorithm": "linear_regression",
            "threshold": {"metric": "accuracy", "comparison": "at_least", "value": 0.8}
        }"#;
        let spec: DefinitionSpec = serde_json::from_str(raw).unwrap();
        assert_eq!(spec.tolerance, 0.10);
        assert_eq!(spec.task.as_str(), "cost");
        assert!(spec.hyperparameters.get("epochs").is_none());
    }
}
