//! Prediction serving against the active version of a definition.
//!
//! Requests are fingerprinted after feature engineering. A fresh cached result is
//! served directly; otherwise identical concurrent requests coalesce so only one
//! inference runs. Every served prediction is appended to the prediction log.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tracing::debug;

use crate::common::config::ServingCfg;
use crate::common::error::{EngineError, EngineResult};
use crate::common::ids::{DefinitionId, Fingerprint, StableHash, VersionId};
use crate::common::time;
use crate::data::domain::Record;
use crate::data::service::build_row;
use crate::monitoring::domain::PredictionRecord;
use crate::monitoring::service::PredictionLog;
use crate::training::algorithms::{AlgorithmCatalog, Predictor};
use crate::training::domain::{ModelDefinition, ModelVersion, StoredFeatureSet};
use crate::training::registry::ModelRegistry;

use super::cache::{PredictionCache, Served, SingleFlight};
use super::domain::{CachedInference, Prediction};

/// A version prepared for serving: its checked feature set and decoded model.
#[derive(Clone)]
struct LoadedVersion {
    definition_id: DefinitionId,
    feature_set: Arc<StoredFeatureSet>,
    model: Arc<dyn Predictor>,
}

/// Everything needed to serve one version, resolved once per call or batch.
struct Serving {
    definition_id: DefinitionId,
    version: ModelVersion,
    loaded: LoadedVersion,
}

pub struct PredictionService {
    registry: Arc<ModelRegistry>,
    catalog: Arc<AlgorithmCatalog>,
    log: Arc<PredictionLog>,
    cache: Arc<PredictionCache>,
    flights: SingleFlight<Fingerprint, EngineResult<CachedInference>>,
    // Versions whose feature set passed the checksum check and whose artifact is decoded.
    loaded: Arc<DashMap<VersionId, LoadedVersion>>,
}

impl PredictionService {
    /// Build the service and subscribe its cache to active-version changes.
    pub fn new(
        registry: Arc<ModelRegistry>,
        catalog: Arc<AlgorithmCatalog>,
        log: Arc<PredictionLog>,
        cfg: &ServingCfg,
    ) -> Self {
        let cache = Arc::new(PredictionCache::new(cfg.cache_ttl(), cfg.cache_capacity));
        let loaded: Arc<DashMap<VersionId, LoadedVersion>> = Arc::new(DashMap::new());
        {
            let (cache, loaded) = (cache.clone(), loaded.clone());
            registry.on_active_change(Arc::new(move |definition: DefinitionId, _: Option<VersionId>| {
                cache.invalidate(definition);
                loaded.retain(|_, v| v.definition_id != definition);
            }));
        }
        Self {
            registry,
            catalog,
            log,
            cache,
            flights: SingleFlight::new(),
            loaded,
        }
    }

    pub fn cache(&self) -> &PredictionCache {
        &self.cache
    }

    /// Validate the input, then answer from cache or run the active model once per key.
    pub fn predict(&self, definition_id: DefinitionId, input: &Record) -> EngineResult<Prediction> {
        let serving = self.resolve(definition_id)?;
        self.serve(&serving, input, 0)
    }

    /// Serve many inputs against one version. The outer error covers the definition
    /// (no active model, skewed features); per-row input errors stay per row.
    pub fn predict_batch(
        &self,
        definition_id: DefinitionId,
        inputs: &[Record],
    ) -> EngineResult<Vec<EngineResult<Prediction>>> {
        let serving = self.resolve(definition_id)?;
        Ok(inputs
            .iter()
            .enumerate()
            .map(|(row, input)| self.serve(&serving, input, row))
            .collect())
    }

    fn resolve(&self, definition_id: DefinitionId) -> EngineResult<Serving> {
        let definition = self.registry.definition(definition_id)?;
        let version = self
            .registry
            .get_active(definition_id)?
            .ok_or(EngineError::NoActiveModel(definition_id.raw()))?;
        let loaded = self.load(&definition, &version)?;
        Ok(Serving {
            definition_id,
            version,
            loaded,
        })
    }

    /// Check and decode a version the first time it serves; later calls hit the map.
    fn load(&self, definition: &ModelDefinition, version: &ModelVersion) -> EngineResult<LoadedVersion> {
        if let Some(hit) = self.loaded.get(&version.id) {
            return Ok(hit.clone());
        }
        let feature_set = self.verified_feature_set(version)?;
        let artifact = version
            .artifact
            .as_ref()
            .ok_or_else(|| EngineError::Storage(format!("artifact of {} is missing", version.id)))?;
        let model = self.catalog.get(&definition.spec.algorithm)?.load(artifact)?;
        let loaded = LoadedVersion {
            definition_id: version.definition_id,
            feature_set,
            model,
        };
        self.loaded.insert(version.id, loaded.clone());
        debug!(definition = %version.definition_id, version = %version.id, "version loaded for serving");
        Ok(loaded)
    }

    /// The feature set a version was trained with, checked against the checksum the
    /// version recorded. A mismatch means serving would skew from training.
    fn verified_feature_set(&self, version: &ModelVersion) -> EngineResult<Arc<StoredFeatureSet>> {
        let id = version.feature_set_id.ok_or_else(|| EngineError::FeatureSkew {
            feature_set: format!("{} has no feature set", version.id),
        })?;
        let stored = self.registry.feature_set(id)?;
        let actual = stored.feature_set.checksum()?;
        if version.feature_set_checksum != Some(actual) || stored.checksum != actual {
            return Err(EngineError::FeatureSkew {
                feature_set: id.to_string(),
            });
        }
        Ok(stored)
    }

    fn serve(&self, serving: &Serving, input: &Record, row: usize) -> EngineResult<Prediction> {
        let started = Instant::now();
        let mut features = Vec::new();
        build_row(input, &serving.loaded.feature_set.feature_set, row, &mut features)?;
        let fingerprint = fingerprint(serving.definition_id, serving.version.id, &features);
        let definition = serving.definition_id;

        let (result, served) = self.flights.run(
            fingerprint,
            || self.cache.get(definition, fingerprint).map(Ok),
            || {
                let inferred = serving
                    .loaded
                    .model
                    .predict(&features)
                    .map(|out| CachedInference {
                        version_id: serving.version.id,
                        value: out.value,
                        confidence: out.confidence,
                    });
                if let Ok(inference) = &inferred {
                    self.cache.put(definition, fingerprint, *inference);
                }
                inferred
            },
        );
        let inference = result?;
        let served_from_cache = served == Served::Shared;

        let record = PredictionRecord {
            id: self.log.next_id(),
            definition_id: definition,
            version_id: inference.version_id,
            fingerprint,
            value: inference.value,
            confidence: inference.confidence,
            served_from_cache,
            created_ms: time::now_ms(),
            ground_truth: None,
            outcome_ms: None,
        };
        self.log.append(record.clone())?;
        debug!(
            definition = %definition,
            version = %inference.version_id,
            fingerprint = %fingerprint,
            served_from_cache,
            elapsed_us = started.elapsed().as_micros() as u64,
            "prediction served"
        );
        Ok(Prediction {
            prediction_id: record.id,
            definition_id: definition,
            value: inference.value,
            confidence: inference.confidence,
            model_version_id: inference.version_id,
            served_from_cache,
            fingerprint,
        })
    }
}

/// Stable key over the serving version and the engineered input row.
pub fn fingerprint(definition: DefinitionId, version: VersionId, features: &[f64]) -> Fingerprint {
    let mut hash = StableHash::new();
    hash.update_u64(definition.raw());
    hash.update_u64(version.raw());
    for x in features {
        // Normalise -0.0 so equal rows hash equally.
        let x = if *x == 0.0 { 0.0 } else { *x };
        hash.update(&x.to_bits().to_le_bytes());
    }
    Fingerprint(hash.finish64())
}
