//! Prediction results handed back to callers.

use serde::{Deserialize, Serialize};

use crate::common::ids::{DefinitionId, Fingerprint, PredictionId, VersionId};

/// One served prediction.
///
/// `served_from_cache` is set when no inference ran for this request: either a
/// cached result was still fresh, or the request joined an identical in-flight one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub prediction_id: PredictionId,
    pub definition_id: DefinitionId,
    pub value: f64,
    pub confidence: f64,
    pub model_version_id: VersionId,
    pub served_from_cache: bool,
    pub fingerprint: Fingerprint,
}

/// What the cache and single-flight share: the raw inference for a fingerprint.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CachedInference {
    pub version_id: VersionId,
    pub value: f64,
    pub confidence: f64,
}
