//! Prediction log, outcome feedback and drift detection.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::common::config::MonitoringCfg;
use crate::common::error::{DataError, EngineError, EngineResult};
use crate::common::ids::{DefinitionId, IdGenerator, PredictionId, VersionId};
use crate::common::time;
use crate::evaluation::service::is_correct;
use crate::training::domain::RegistryRepo;
use crate::training::registry::ModelRegistry;

use super::domain::{AccuracySummary, DriftSignal, PredictionRecord, Window};

#[derive(Default)]
struct LogState {
    records: BTreeMap<PredictionId, PredictionRecord>,
    per_definition: HashMap<DefinitionId, usize>,
}

/// Bounded, persisted log of served predictions.
///
/// Holds at most `retention` records per definition; older ones are evicted from
/// memory and from the repository.
pub struct PredictionLog {
    state: RwLock<LogState>,
    ids: IdGenerator,
    repo: Arc<dyn RegistryRepo>,
    retention: usize,
}

impl PredictionLog {
    /// Empty log keeping at most `retention` records per definition.
    pub fn new(repo: Arc<dyn RegistryRepo>, retention: usize) -> Self {
        Self {
            state: RwLock::new(LogState::default()),
            ids: IdGenerator::new(),
            repo,
            retention: retention.max(1),
        }
    }

    /// Reload records persisted by a previous process.
    pub fn restore(&self, records: Vec<PredictionRecord>) -> EngineResult<()> {
        let mut state = self.state.write();
        for record in records {
            self.ids.observe(record.id.raw());
            *state.per_definition.entry(record.definition_id).or_default() += 1;
            state.records.insert(record.id, record);
        }
        let definitions: Vec<DefinitionId> = state.per_definition.keys().copied().collect();
        for definition in definitions {
            self.evict(&mut state, definition);
        }
        Ok(())
    }

    pub fn next_id(&self) -> PredictionId {
        PredictionId(self.ids.next())
    }

    /// Persist and index a served prediction, then trim the definition to `retention`.
    pub fn append(&self, record: PredictionRecord) -> EngineResult<()> {
        self.repo.put_prediction(&record)?;
        let mut state = self.state.write();
        let definition = record.definition_id;
        *state.per_definition.entry(definition).or_default() += 1;
        state.records.insert(record.id, record);
        self.evict(&mut state, definition);
        Ok(())
    }

    /// Drop the oldest records beyond `retention`. A record the repository fails to
    /// remove stays indexed and is retried by the next eviction.
    fn evict(&self, state: &mut LogState, definition: DefinitionId) {
        let held = state.per_definition.get(&definition).copied().unwrap_or(0);
        if held <= self.retention {
            return;
        }
        let excess = held - self.retention;
        let oldest: Vec<PredictionId> = state
            .records
            .values()
            .filter(|r| r.definition_id == definition)
            .take(excess)
            .map(|r| r.id)
            .collect();
        let mut evicted = 0;
        for id in oldest {
            if let Err(err) = self.repo.remove_prediction(id) {
                warn!(definition = %definition, prediction = %id, error = %err, "prediction eviction failed");
                break;
            }
            state.records.remove(&id);
            evicted += 1;
        }
        if let Some(count) = state.per_definition.get_mut(&definition) {
            *count -= evicted;
        }
        if evicted > 0 {
            debug!(definition = %definition, evicted, "prediction records evicted");
        }
    }

    /// Look up a retained prediction.
    pub fn get(&self, id: PredictionId) -> EngineResult<PredictionRecord> {
        self.state
            .read()
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("prediction", id))
    }

    /// Attach the observed value. Each record accepts exactly one outcome.
    pub fn record_outcome(&self, id: PredictionId, ground_truth: f64) -> EngineResult<PredictionRecord> {
        if !ground_truth.is_finite() {
            return Err(DataError::InvalidValue {
                column: "ground_truth".into(),
                row: 0,
                value: ground_truth.to_string(),
            }
            .into());
        }
        let mut state = self.state.write();
        let record = state
            .records
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("prediction", id))?;
        if record.ground_truth.is_some() {
            return Err(EngineError::OutcomeAlreadyRecorded(id.raw()));
        }
        let mut updated = record.clone();
        updated.ground_truth = Some(ground_truth);
        updated.outcome_ms = Some(time::now_ms());
        self.repo.put_prediction(&updated)?;
        *record = updated.clone();
        debug!(prediction = %id, version = %updated.version_id, "outcome recorded");
        Ok(updated)
    }

    /// Records of `definition` (optionally one version) that have an outcome, newest first.
    fn with_outcomes(
        &self,
        definition: DefinitionId,
        version: Option<VersionId>,
        window: Window,
    ) -> Vec<PredictionRecord> {
        let state = self.state.read();
        let matching = state.records.values().rev().filter(|r| {
            r.definition_id == definition
                && r.ground_truth.is_some()
                && version.map_or(true, |v| r.version_id == v)
        });
        match window {
            Window::Last(n) => matching.take(n).cloned().collect(),
            Window::Since(age) => {
                let cutoff = time::now_ms().saturating_sub(age.as_millis() as u64);
                matching.filter(|r| r.created_ms >= cutoff).cloned().collect()
            }
        }
    }

    /// Records currently retained for a definition.
    pub fn len(&self, definition: DefinitionId) -> usize {
        self.state
            .read()
            .per_definition
            .get(&definition)
            .copied()
            .unwrap_or(0)
    }
}

/// Live accuracy and drift over the prediction log.
pub struct Monitor {
    registry: Arc<ModelRegistry>,
    log: Arc<PredictionLog>,
    cfg: MonitoringCfg,
}

impl Monitor {
    pub fn new(registry: Arc<ModelRegistry>, log: Arc<PredictionLog>, cfg: MonitoringCfg) -> Self {
        Self { registry, log, cfg }
    }

    pub fn log(&self) -> &Arc<PredictionLog> {
        &self.log
    }

    /// Record ground truth for a served prediction.
    pub fn record_outcome(&self, id: PredictionId, ground_truth: f64) -> EngineResult<PredictionRecord> {
        self.log.record_outcome(id, ground_truth)
    }

    /// Accuracy of predictions with outcomes inside `window`, judged the same way as
    /// held-out evaluation for the definition's problem kind.
    pub fn window_accuracy(
        &self,
        definition_id: DefinitionId,
        version_id: Option<VersionId>,
        window: Window,
    ) -> EngineResult<AccuracySummary> {
        let definition = self.registry.definition(definition_id)?;
        let records = self.log.with_outcomes(definition_id, version_id, window);
        let mut correct = 0;
        let mut abs_error = 0.0;
        for record in &records {
            let Some(truth) = record.ground_truth else {
                continue;
            };
            if is_correct(record.value, truth, definition.spec.problem, definition.spec.tolerance) {
                correct += 1;
            }
            abs_error += (record.value - truth).abs();
        }
        let samples = records.len();
        let (accuracy, mean_absolute_error) = if samples == 0 {
            (None, None)
        } else {
            (
                Some(correct as f64 / samples as f64),
                Some(abs_error / samples as f64),
            )
        };
        Ok(AccuracySummary {
            definition_id,
            version_id,
            samples,
            correct,
            accuracy,
            mean_absolute_error,
        })
    }

    /// Compare the active version's live accuracy with its accuracy at promotion.
    ///
    /// Advisory only: nothing is retrained or demoted here.
    pub fn check_drift(&self, definition_id: DefinitionId) -> EngineResult<DriftSignal> {
        let definition = self.registry.definition(definition_id)?;
        let active = self
            .registry
            .get_active(definition_id)?
            .ok_or(EngineError::NoActiveModel(definition_id.raw()))?;
        let baseline = active
            .promoted_accuracy
            .ok_or_else(|| EngineError::permanent(format!("version {} has no promotion metric", active.id)))?;

        let summary =
            self.window_accuracy(definition_id, Some(active.id), Window::Last(self.cfg.drift_window))?;
        let allowed_delta = definition.spec.drift_delta;
        let insufficient_samples = summary.samples < self.cfg.drift_min_samples;
        let drifted = !insufficient_samples
            && summary
                .accuracy
                .is_some_and(|observed| baseline - observed > allowed_delta);

        let signal = DriftSignal {
            definition_id,
            version_id: active.id,
            drifted,
            baseline_accuracy: baseline,
            observed_accuracy: summary.accuracy,
            allowed_delta,
            samples: summary.samples,
            insufficient_samples,
        };
        if drifted {
            warn!(
                definition = %definition_id,
                version = %active.id,
                baseline,
                observed = ?signal.observed_accuracy,
                allowed_delta,
                samples = signal.samples,
                "drift detected"
            );
        } else {
            info!(
                definition = %definition_id,
                version = %active.id,
                observed = ?signal.observed_accuracy,
                samples = signal.samples,
                insufficient_samples,
                "drift check passed"
            );
        }
        Ok(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::Fingerprint;
    use crate::training::repo_mem::MemoryRepo;
    use std::time::Duration;

    fn record(log: &PredictionLog, definition: u64, value: f64) -> PredictionRecord {
        let record = PredictionRecord {
            id: log.next_id(),
            definition_id: DefinitionId(definition),
            version_id: VersionId(1),
            fingerprint: Fingerprint(value.to_bits()),
            value,
            confidence: 0.5,
            served_from_cache: false,
            created_ms: time::now_ms(),
            ground_truth: None,
            outcome_ms: None,
        };
        log.append(record.clone()).unwrap();
        record
    }

    #[test]
    fn outcome_is_recorded_exactly_once() {
        let log = PredictionLog::new(Arc::new(MemoryRepo::new()), 100);
        let rec = record(&log, 1, 10.0);
        let updated = log.record_outcome(rec.id, 11.0).unwrap();
        assert_eq!(updated.ground_truth, Some(11.0));
        assert!(updated.outcome_ms.is_some());
        assert_eq!(
            log.record_outcome(rec.id, 12.0).unwrap_err(),
            EngineError::OutcomeAlreadyRecorded(rec.id.raw())
        );
        assert_eq!(log.get(rec.id).unwrap().ground_truth, Some(11.0));
    }

    #[test]
    fn non_finite_outcome_is_a_data_error() {
        let log = PredictionLog::new(Arc::new(MemoryRepo::new()), 100);
        let rec = record(&log, 1, 10.0);
        assert!(matches!(
            log.record_outcome(rec.id, f64::NAN),
            Err(EngineError::Data(DataError::InvalidValue { .. }))
        ));
        assert!(matches!(
            log.record_outcome(PredictionId(999), 1.0),
            Err(EngineError::NotFound { kind: "prediction", .. })
        ));
    }

    #[test]
    fn retention_is_per_definition() {
        let repo = Arc::new(MemoryRepo::new());
        let log = PredictionLog::new(repo.clone(), 3);
        let first = record(&log, 1, 1.0);
        for v in 2..=5 {
            record(&log, 1, v as f64);
        }
        let other = record(&log, 2, 9.0);
        assert_eq!(log.len(DefinitionId(1)), 3);
        assert_eq!(log.len(DefinitionId(2)), 1);
        assert!(log.get(first.id).is_err());
        assert!(log.get(other.id).is_ok());
        assert_eq!(repo.load().unwrap().predictions.len(), 4);
    }

    #[test]
    fn windows_select_recent_outcomes() {
        let log = PredictionLog::new(Arc::new(MemoryRepo::new()), 100);
        let ids: Vec<_> = (0..5).map(|v| record(&log, 1, v as f64).id).collect();
        for id in &ids[..4] {
            log.record_outcome(*id, 0.0).unwrap();
        }
        let last_two = log.with_outcomes(DefinitionId(1), None, Window::Last(2));
        assert_eq!(last_two.iter().map(|r| r.id).collect::<Vec<_>>(), vec![ids[3], ids[2]]);
        let recent = log.with_outcomes(DefinitionId(1), None, Window::Since(Duration::from_secs(60)));
        assert_eq!(recent.len(), 4);
        assert!(log.with_outcomes(DefinitionId(1), Some(VersionId(2)), Window::Last(10)).is_empty());
    }

    /// Memory repo whose deletes can be switched to fail.
    #[derive(Default)]
    struct StickyRepo {
        inner: MemoryRepo,
        fail_removes: std::sync::atomic::AtomicBool,
    }

    impl RegistryRepo for StickyRepo {
        fn put_definition(&self, d: &crate::training::domain::ModelDefinition) -> EngineResult<()> {
            self.inner.put_definition(d)
        }
        fn put_version(&self, v: &crate::training::domain::ModelVersion) -> EngineResult<()> {
            self.inner.put_version(v)
        }
        fn put_versions(&self, v: &[crate::training::domain::ModelVersion]) -> EngineResult<()> {
            self.inner.put_versions(v)
        }
        fn put_job(&self, j: &crate::training::domain::TrainingJob) -> EngineResult<()> {
            self.inner.put_job(j)
        }
        fn put_feature_set(&self, f: &crate::training::domain::StoredFeatureSet) -> EngineResult<()> {
            self.inner.put_feature_set(f)
        }
        fn put_prediction(&self, record: &PredictionRecord) -> EngineResult<()> {
            self.inner.put_prediction(record)
        }
        fn remove_prediction(&self, id: PredictionId) -> EngineResult<()> {
            if self.fail_removes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(EngineError::Storage("device busy".into()));
            }
            self.inner.remove_prediction(id)
        }
        fn load(&self) -> EngineResult<crate::training::domain::RepoSnapshot> {
            self.inner.load()
        }
    }

    #[test]
    fn failed_eviction_keeps_counts_exact_and_serving_alive() {
        use std::sync::atomic::Ordering;

        let repo = Arc::new(StickyRepo::default());
        let log = PredictionLog::new(repo.clone(), 2);
        let first = record(&log, 1, 1.0);
        record(&log, 1, 2.0);

        repo.fail_removes.store(true, Ordering::SeqCst);
        // Appending still succeeds; the record that could not be evicted stays indexed.
        let third = record(&log, 1, 3.0);
        assert_eq!(log.len(DefinitionId(1)), 3);
        assert!(log.get(first.id).is_ok());
        assert_eq!(repo.load().unwrap().predictions.len(), 3);

        repo.fail_removes.store(false, Ordering::SeqCst);
        record(&log, 1, 4.0);
        assert_eq!(log.len(DefinitionId(1)), 2);
        assert!(log.get(first.id).is_err());
        assert!(log.get(third.id).is_ok());
        let stored = repo.load().unwrap().predictions;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored.len(), log.len(DefinitionId(1)));
    }
}
