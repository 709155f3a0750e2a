//! Filesystem repository: one JSON document per row under `<data_root>/registry/<table>/`.
//!
//! Rows are written to a temporary file and renamed into place, so a crash leaves
//! either the old or the new row. Version artifacts live beside their row as `<id>.bin`.
//!
//! Multi-row version writes go through `versions.journal`: the batch is made durable
//! in one rename, then applied row by row and removed. A journal found on disk is
//! replayed before anything else reads or writes versions.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::common::config::EngineConfig;
use crate::common::error::{EngineError, EngineResult};
use crate::common::ids::PredictionId;
use crate::monitoring::domain::PredictionRecord;

use super::domain::{
    ModelDefinition, ModelVersion, RegistryRepo, RepoSnapshot, StoredFeatureSet, TrainingJob,
};

const DEFINITIONS: &str = "definitions";
const VERSIONS: &str = "versions";
const JOBS: &str = "jobs";
const FEATURE_SETS: &str = "feature_sets";
const PREDICTIONS: &str = "predictions";
const JOURNAL: &str = "versions.journal";

pub struct FsRegistryRepo {
    root: PathBuf,
}

impl FsRegistryRepo {
    pub fn new(cfg: &EngineConfig) -> EngineResult<Self> {
        Self::at(PathBuf::from(&cfg.data_root).join("registry"))
    }

    pub fn at(root: impl Into<PathBuf>) -> EngineResult<Self> {
        let root = root.into();
        for table in [DEFINITIONS, VERSIONS, JOBS, FEATURE_SETS, PREDICTIONS] {
            fs::create_dir_all(root.join(table))?;
        }
        Ok(Self { root })
    }

    fn row_path(&self, table: &str, id: u64, ext: &str) -> PathBuf {
        self.root.join(table).join(format!("{id:020}.{ext}"))
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> EngineResult<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn put_artifact(&self, version: &ModelVersion) -> EngineResult<()> {
        if let Some(artifact) = &version.artifact {
            let path = self.row_path(VERSIONS, version.id.raw(), "bin");
            if !path.exists() {
                Self::write_atomic(&path, artifact)?;
            }
        }
        Ok(())
    }

    fn journal_path(&self) -> PathBuf {
        self.root.join(JOURNAL)
    }

    /// Make `versions` durable as a single file. Once this returns the batch is committed.
    fn commit_journal(&self, versions: &[ModelVersion]) -> EngineResult<()> {
        let bytes = serde_json::to_vec(versions)?;
        Self::write_atomic(&self.journal_path(), &bytes)
    }

    fn apply_journal(&self, versions: &[ModelVersion]) -> EngineResult<()> {
        for version in versions {
            self.put_row(VERSIONS, version.id.raw(), version)?;
        }
        fs::remove_file(self.journal_path())?;
        Ok(())
    }

    /// Finish a batch a previous call or process committed but did not apply.
    fn replay_journal(&self) -> EngineResult<()> {
        let raw = match fs::read(self.journal_path()) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let versions: Vec<ModelVersion> = serde_json::from_slice(&raw)
            .map_err(|e| EngineError::Storage(format!("{JOURNAL}: {e}")))?;
        warn!(rows = versions.len(), "replaying version journal");
        self.apply_journal(&versions)
    }

    fn put_row<T: Serialize>(&self, table: &str, id: u64, row: &T) -> EngineResult<()> {
        let bytes = serde_json::to_vec_pretty(row)?;
        Self::write_atomic(&self.row_path(table, id, "json"), &bytes)
    }

    fn load_table<T: DeserializeOwned>(&self, table: &str) -> EngineResult<Vec<(PathBuf, T)>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(self.root.join(table))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut rows = Vec::with_capacity(paths.len());
        for path in paths {
            let raw = fs::read(&path)?;
            match serde_json::from_slice(&raw) {
                Ok(row) => rows.push((path, row)),
                Err(e) => {
                    return Err(EngineError::Storage(format!("{}: {e}", path.display())));
                }
            }
        }
        Ok(rows)
    }
}

impl RegistryRepo for FsRegistryRepo {
    fn put_definition(&self, definition: &ModelDefinition) -> EngineResult<()> {
        self.put_row(DEFINITIONS, definition.id.raw(), definition)
    }

    fn put_version(&self, version: &ModelVersion) -> EngineResult<()> {
        self.replay_journal()?;
        self.put_artifact(version)?;
        self.put_row(VERSIONS, version.id.raw(), version)
    }

    fn put_versions(&self, versions: &[ModelVersion]) -> EngineResult<()> {
        self.replay_journal()?;
        for version in versions {
            self.put_artifact(version)?;
        }
        self.commit_journal(versions)?;
        if let Err(err) = self.apply_journal(versions) {
            // Committed already; the next write or load finishes the batch.
            warn!(error = %err, "version journal left for replay");
        }
        Ok(())
    }

    fn put_job(&self, job: &TrainingJob) -> EngineResult<()> {
        self.put_row(JOBS, job.id.raw(), job)
    }

    fn put_feature_set(&self, feature_set: &StoredFeatureSet) -> EngineResult<()> {
        self.put_row(FEATURE_SETS, feature_set.id.raw(), feature_set)
    }

    fn put_prediction(&self, record: &PredictionRecord) -> EngineResult<()> {
        self.put_row(PREDICTIONS, record.id.raw(), record)
    }

    fn remove_prediction(&self, id: PredictionId) -> EngineResult<()> {
        match fs::remove_file(self.row_path(PREDICTIONS, id.raw(), "json")) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn load(&self) -> EngineResult<RepoSnapshot> {
        self.replay_journal()?;
        let mut versions = Vec::new();
        for (path, mut version) in self.load_table::<ModelVersion>(VERSIONS)? {
            let bin = path.with_extension("bin");
            match fs::read(&bin) {
                Ok(bytes) => version.artifact = Some(Arc::new(bytes)),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    if version.feature_set_id.is_some() {
                        warn!(version = %version.id, "artifact file missing for trained version");
                    }
                }
                Err(e) => return Err(e.into()),
            }
            versions.push(version);
        }

        Ok(RepoSnapshot {
            definitions: strip(self.load_table(DEFINITIONS)?),
            versions,
            jobs: strip(self.load_table(JOBS)?),
            feature_sets: strip(self.load_table(FEATURE_SETS)?),
            predictions: strip(self.load_table(PREDICTIONS)?),
        })
    }
}

fn strip<T>(rows: Vec<(PathBuf, T)>) -> Vec<T> {
    rows.into_iter().map(|(_, row)| row).collect()
}
