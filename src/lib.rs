//! Model lifecycle and training orchestration engine.
//!
//! Registers predictive model definitions, engineers features, trains versions on a
//! supervised worker pool, promotes them through a validated state machine, serves
//! predictions with caching and coalescing, and tracks live accuracy for drift.

pub mod api;
pub mod common;
pub mod data;
pub mod evaluation;
pub mod inference;
pub mod monitoring;
pub mod training;

pub use api::{Engine, API_VERSION};
pub use common::{
    DataError, DefinitionId, EngineConfig, EngineError, EngineResult, ErrorCode, JobId,
    PredictionId, VersionId,
};
pub use data::{DataSource, FeatureRule, FsDataSource, MemoryDataSource, Record, RuleKind, Value};
pub use evaluation::{MetricName, ProblemKind, PromotionThreshold};
pub use inference::Prediction;
pub use monitoring::{AccuracySummary, DriftSignal, Window};
pub use training::{
    Algorithm, AlgorithmCatalog, DefinitionSpec, Hyperparameters, JobStatus, ModelVersion,
    Predictor, TaskType, TrainingJob, VersionStatus,
};
