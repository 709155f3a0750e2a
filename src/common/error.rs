//! Error handling primitives shared across the core.
//!
//! Every failure surfaces as an [`EngineError`]. Data problems are never turned
//! into placeholder values, and a missing active model is its own variant so
//! callers can present "insight unavailable" rather than a zero.

use thiserror::Error;

/// Stable error codes for outer layers (HTTP mapping, job tables, dashboards).
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    /// Input data failed validation.
    Data = 1,
    /// Another operation holds the resource (duplicate training, stale promotion).
    Conflict = 2,
    /// Training could not complete.
    TrainingFailed = 3,
    /// No servable model version exists for the definition.
    NoActiveModel = 4,
    /// Trained but below the promotion threshold.
    EvaluationRejected = 5,
    /// Requested entity does not exist.
    NotFound = 6,
    /// The training queue is saturated.
    Busy = 7,
    /// Persistence or configuration problem.
    Internal = 8,
}

/// Problems found in caller supplied or snapshot records.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("missing column `{column}` in row {row}")]
    MissingColumn { column: String, row: usize },

    #[error("invalid value `{value}` for column `{column}` in row {row}")]
    InvalidValue {
        column: String,
        row: usize,
        value: String,
    },

    #[error("insufficient rows: need at least {required}, found {found}")]
    InsufficientRows { required: usize, found: usize },

    #[error("feature set has no rules")]
    EmptyFeatureSet,
}

/// Canonical error type for the core.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("training already in progress for definition {definition} (version {version})")]
    TrainingInProgress { definition: u64, version: u64 },

    #[error("stale promotion of version {version}: {reason}")]
    StalePromotion { version: u64, reason: String },

    #[error("invalid transition for version {version}: {from} -> {to}")]
    InvalidTransition {
        version: u64,
        from: String,
        to: String,
    },

    #[error("outcome already recorded for prediction {0}")]
    OutcomeAlreadyRecorded(u64),

    #[error("training failed: {message}")]
    Training { transient: bool, message: String },

    #[error("training exceeded its budget of {budget_ms} ms")]
    Timeout { budget_ms: u64 },

    #[error("training job {0} was cancelled")]
    Cancelled(u64),

    #[error("no active model for definition {0}")]
    NoActiveModel(u64),

    #[error("version {version} rejected: {metric} = {observed} does not meet threshold")]
    EvaluationRejected {
        version: u64,
        metric: String,
        observed: f64,
    },

    #[error("feature set {feature_set} does not match the checksum captured at training time")]
    FeatureSkew { feature_set: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("training queue is full ({capacity} jobs)")]
    QueueFull { capacity: usize },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Result alias used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Retryable training failure (data source hiccup, worker loss).
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Training {
            transient: true,
            message: message.into(),
        }
    }

    /// Terminal training failure (schema mismatch, bad hyperparameters).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Training {
            transient: false,
            message: message.into(),
        }
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    /// Whether the orchestrator may retry the job that produced this error.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Training { transient, .. } => *transient,
            EngineError::Timeout { .. } | EngineError::Storage(_) => true,
            _ => false,
        }
    }

    /// Stable code for callers that branch on the failure kind.
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::Data(_) => ErrorCode::Data,
            EngineError::TrainingInProgress { .. }
            | EngineError::StalePromotion { .. }
            | EngineError::InvalidTransition { .. }
            | EngineError::OutcomeAlreadyRecorded(_) => ErrorCode::Conflict,
            EngineError::Training { .. } | EngineError::Timeout { .. } | EngineError::Cancelled(_) => {
                ErrorCode::TrainingFailed
            }
            EngineError::NoActiveModel(_) => ErrorCode::NoActiveModel,
            EngineError::EvaluationRejected { .. } => ErrorCode::EvaluationRejected,
            EngineError::NotFound { .. } => ErrorCode::NotFound,
            EngineError::QueueFull { .. } => ErrorCode::Busy,
            EngineError::FeatureSkew { .. } | EngineError::Config(_) | EngineError::Storage(_) => {
                ErrorCode::Internal
            }
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Storage(format!("json: {err}"))
    }
}
