//! Volatile repository for tests and hosts that persist elsewhere.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::common::error::EngineResult;
use crate::common::ids::{DefinitionId, FeatureSetId, JobId, PredictionId, VersionId};
use crate::monitoring::domain::PredictionRecord;

use super::domain::{
    ModelDefinition, ModelVersion, RegistryRepo, RepoSnapshot, StoredFeatureSet, TrainingJob,
};

#[derive(Default)]
struct Tables {
    definitions: BTreeMap<DefinitionId, ModelDefinition>,
    versions: BTreeMap<VersionId, ModelVersion>,
    jobs: BTreeMap<JobId, TrainingJob>,
    feature_sets: BTreeMap<FeatureSetId, StoredFeatureSet>,
    predictions: BTreeMap<PredictionId, PredictionRecord>,
}

#[derive(Default)]
pub struct MemoryRepo {
    tables: Mutex<Tables>,
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegistryRepo for MemoryRepo {
    fn put_definition(&self, definition: &ModelDefinition) -> EngineResult<()> {
        self.tables
            .lock()
            .definitions
            .insert(definition.id, definition.clone());
        Ok(())
    }

    fn put_version(&self, version: &ModelVersion) -> EngineResult<()> {
        self.tables.lock().versions.insert(version.id, version.clone());
        Ok(())
    }

    fn put_versions(&self, versions: &[ModelVersion]) -> EngineResult<()> {
        let mut tables = self.tables.lock();
        for version in versions {
            tables.versions.insert(version.id, version.clone());
        }
        Ok(())
    }

    fn put_job(&self, job: &TrainingJob) -> EngineResult<()> {
        self.tables.lock().jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn put_feature_set(&self, feature_set: &StoredFeatureSet) -> EngineResult<()> {
        self.tables
            .lock()
            .feature_sets
            .insert(feature_set.id, feature_set.clone());
        Ok(())
    }

    fn put_prediction(&self, record: &PredictionRecord) -> EngineResult<()> {
        self.tables.lock().predictions.insert(record.id, record.clone());
        Ok(())
    }

    fn remove_prediction(&self, id: PredictionId) -> EngineResult<()> {
        self.tables.lock().predictions.remove(&id);
        Ok(())
    }

    fn load(&self) -> EngineResult<RepoSnapshot> {
        let t = self.tables.lock();
        Ok(RepoSnapshot {
            definitions: t.definitions.values().cloned().collect(),
            versions: t.versions.values().cloned().collect(),
            jobs: t.jobs.values().cloned().collect(),
            feature_sets: t.feature_sets.values().cloned().collect(),
            predictions: t.predictions.values().cloned().collect(),
        })
    }
}
