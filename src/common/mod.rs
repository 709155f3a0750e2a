//! Shared plumbing used by every domain: configuration, errors, identifiers,
//! logging and clocks.
pub mod config;
pub mod error;
pub mod ids;
pub mod log;
pub mod time;

pub use config::EngineConfig;
pub use error::{DataError, EngineError, EngineResult, ErrorCode};
pub use ids::{DefinitionId, FeatureSetId, Fingerprint, JobId, PredictionId, VersionId};
