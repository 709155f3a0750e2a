//! The model registry: single source of truth for definitions, versions, their
//! lifecycle status and the feature sets they were trained with.
//!
//! All state lives behind one `RwLock`. Every status change is validated against
//! [`VersionStatus::can_transition_to`], written through to the repository and only
//! then committed in memory. Promotion writes the demoted and the promoted row as
//! one repository batch inside the same critical section, so neither readers nor a
//! reopened registry observe zero or two active versions mid-swap.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::common::error::{EngineError, EngineResult};
use crate::common::ids::{DefinitionId, FeatureSetId, IdGenerator, VersionId};
use crate::common::time;
use crate::data::domain::FeatureSet;
use crate::evaluation::domain::Metrics;

use super::domain::{
    DefinitionSpec, ModelDefinition, ModelVersion, RegistryRepo, RepoSnapshot, StoredFeatureSet,
    TrainingResult, VersionStatus,
};
use super::repo_mem::MemoryRepo;

/// Callback fired after the active version of a definition changes.
pub type ActiveChangeListener = Arc<dyn Fn(DefinitionId, Option<VersionId>) + Send + Sync>;

struct DefinitionEntry {
    definition: ModelDefinition,
    versions: Vec<VersionId>,
    active: Option<VersionId>,
    in_flight: Option<VersionId>,
    next_version: u32,
}

#[derive(Default)]
struct RegistryState {
    definitions: HashMap<DefinitionId, DefinitionEntry>,
    by_name: HashMap<String, DefinitionId>,
    versions: HashMap<VersionId, ModelVersion>,
    feature_sets: HashMap<FeatureSetId, Arc<StoredFeatureSet>>,
}

impl RegistryState {
    fn entry(&self, id: DefinitionId) -> EngineResult<&DefinitionEntry> {
        self.definitions
            .get(&id)
            .ok_or_else(|| EngineError::not_found("definition", id))
    }

    fn entry_mut(&mut self, id: DefinitionId) -> EngineResult<&mut DefinitionEntry> {
        self.definitions
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("definition", id))
    }

    fn version(&self, id: VersionId) -> EngineResult<&ModelVersion> {
        self.versions
            .get(&id)
            .ok_or_else(|| EngineError::not_found("version", id))
    }
}

/// Read-only summary of the servable version, for outer layers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActiveSummary {
    pub definition_id: DefinitionId,
    pub definition_name: String,
    pub version_id: VersionId,
    pub version: u32,
    pub metrics: Option<Metrics>,
    pub promoted_accuracy: Option<f64>,
    pub promoted_ms: Option<u64>,
    pub training_rows: usize,
}

pub struct ModelRegistry {
    state: RwLock<RegistryState>,
    repo: Arc<dyn RegistryRepo>,
    definition_ids: IdGenerator,
    version_ids: IdGenerator,
    feature_set_ids: IdGenerator,
    listeners: RwLock<Vec<ActiveChangeListener>>,
}

fn transition(version: &mut ModelVersion, next: VersionStatus) -> EngineResult<()> {
    if !version.status.can_transition_to(next) {
        return Err(EngineError::InvalidTransition {
            version: version.id.raw(),
            from: version.status.to_string(),
            to: next.to_string(),
        });
    }
    version.status = next;
    Ok(())
}

impl ModelRegistry {
    /// Registry backed by a volatile repository.
    pub fn in_memory() -> Self {
        Self::empty(Arc::new(MemoryRepo::new()))
    }

    fn empty(repo: Arc<dyn RegistryRepo>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            repo,
            definition_ids: IdGenerator::new(),
            version_ids: IdGenerator::new(),
            feature_set_ids: IdGenerator::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Rebuild the registry from `repo`.
    ///
    /// If a crash left more than one active version for a definition, the highest
    /// version number stays active and the others are deprecated.
    pub fn open(repo: Arc<dyn RegistryRepo>) -> EngineResult<(Self, RepoSnapshot)> {
        let snapshot = repo.load()?;
        let registry = Self::empty(repo);
        {
            let mut guard = registry.state.write();
            let state = &mut *guard;
            for def in &snapshot.definitions {
                registry.definition_ids.observe(def.id.raw());
                state.by_name.insert(def.spec.name.clone(), def.id);
                state.definitions.insert(
                    def.id,
                    DefinitionEntry {
                        definition: def.clone(),
                        versions: Vec::new(),
                        active: None,
                        in_flight: None,
                        next_version: 1,
                    },
                );
            }

            let mut versions = snapshot.versions.clone();
            versions.sort_by_key(|v| (v.definition_id, v.version));
            for mut version in versions {
                registry.version_ids.observe(version.id.raw());
                let Some(entry) = state.definitions.get_mut(&version.definition_id) else {
                    warn!(version = %version.id, "dropping version of unknown definition");
                    continue;
                };
                entry.versions.push(version.id);
                entry.next_version = entry.next_version.max(version.version + 1);
                match version.status {
                    VersionStatus::Active => {
                        if let Some(prev) = entry.active.replace(version.id) {
                            warn!(definition = %version.definition_id, version = %prev, "repairing duplicate active version");
                            if let Some(old) = state.versions.get_mut(&prev) {
                                old.status = VersionStatus::Deprecated;
                                registry.repo.put_version(old)?;
                            }
                        }
                    }
                    VersionStatus::Training | VersionStatus::Draft => {
                        version.status = VersionStatus::Training;
                        entry.in_flight = Some(version.id);
                    }
                    _ => {}
                }
                state.versions.insert(version.id, version);
            }

            for fs in &snapshot.feature_sets {
                registry.feature_set_ids.observe(fs.id.raw());
                state.feature_sets.insert(fs.id, Arc::new(fs.clone()));
            }
            info!(
                definitions = state.definitions.len(),
                versions = state.versions.len(),
                "registry loaded"
            );
        }
        Ok((registry, snapshot))
    }

    /// Storage backing the registry.
    pub fn repo(&self) -> Arc<dyn RegistryRepo> {
        self.repo.clone()
    }

    /// Subscribe to active-version changes (promotion, deprecation).
    pub fn on_active_change(&self, listener: ActiveChangeListener) {
        self.listeners.write().push(listener);
    }

    fn notify(&self, definition: DefinitionId, active: Option<VersionId>) {
        for listener in self.listeners.read().iter() {
            listener(definition, active);
        }
    }

    /// Validate and persist a new definition. Names are unique.
    pub fn register_definition(&self, spec: DefinitionSpec) -> EngineResult<ModelDefinition> {
        validate_spec(&spec)?;
        let mut state = self.state.write();
        if state.by_name.contains_key(&spec.name) {
            return Err(EngineError::Config(format!(
                "definition `{}` already registered",
                spec.name
            )));
        }
        let definition = ModelDefinition {
            id: DefinitionId(self.definition_ids.next()),
            spec,
            created_ms: time::now_ms(),
        };
        self.repo.put_definition(&definition)?;
        state.by_name.insert(definition.spec.name.clone(), definition.id);
        state.definitions.insert(
            definition.id,
            DefinitionEntry {
                definition: definition.clone(),
                versions: Vec::new(),
                active: None,
                in_flight: None,
                next_version: 1,
            },
        );
        info!(definition = %definition.id, name = %definition.spec.name, "definition registered");
        Ok(definition)
    }

    pub fn definition(&self, id: DefinitionId) -> EngineResult<ModelDefinition> {
        Ok(self.state.read().entry(id)?.definition.clone())
    }

    pub fn definition_by_name(&self, name: &str) -> EngineResult<ModelDefinition> {
        let state = self.state.read();
        let id = state
            .by_name
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::not_found("definition", name))?;
        Ok(state.entry(id)?.definition.clone())
    }

    /// All definitions in id order.
    pub fn list_definitions(&self) -> Vec<ModelDefinition> {
        let state = self.state.read();
        let mut defs: Vec<_> = state
            .definitions
            .values()
            .map(|e| e.definition.clone())
            .collect();
        defs.sort_by_key(|d| d.id);
        defs
    }

    /// Cut a new version in `training`. At most one per definition may be in flight.
    pub fn begin_training(&self, definition_id: DefinitionId) -> EngineResult<ModelVersion> {
        let mut state = self.state.write();
        let entry = state.entry_mut(definition_id)?;
        if let Some(version) = entry.in_flight {
            return Err(EngineError::TrainingInProgress {
                definition: definition_id.raw(),
                version: version.raw(),
            });
        }

        let mut version = ModelVersion {
            id: VersionId(self.version_ids.next()),
            definition_id,
            version: entry.next_version,
            status: VersionStatus::Draft,
            artifact: None,
            metrics: None,
            feature_set_id: None,
            feature_set_checksum: None,
            training_rows: 0,
            created_ms: time::now_ms(),
            trained_ms: None,
            training_duration_ms: None,
            promoted_accuracy: None,
            promoted_ms: None,
            last_error: None,
        };
        transition(&mut version, VersionStatus::Training)?;
        self.repo.put_version(&version)?;

        entry.next_version += 1;
        entry.in_flight = Some(version.id);
        entry.versions.push(version.id);
        state.versions.insert(version.id, version.clone());
        info!(definition = %definition_id, version = %version.id, number = version.version, "training started");
        Ok(version)
    }

    /// Store a finished training run: `validated` if evaluation passed, `rejected` otherwise.
    pub fn record_training_result(
        &self,
        version_id: VersionId,
        result: TrainingResult,
    ) -> EngineResult<ModelVersion> {
        let mut state = self.state.write();
        let mut version = state.version(version_id)?.clone();
        let next = if result.passed {
            VersionStatus::Validated
        } else {
            VersionStatus::Rejected
        };
        transition(&mut version, next)?;
        version.artifact = Some(Arc::new(result.artifact));
        version.metrics = Some(result.metrics);
        version.feature_set_id = Some(result.feature_set_id);
        version.feature_set_checksum = Some(result.feature_set_checksum);
        version.training_rows = result.training_rows;
        version.trained_ms = Some(time::now_ms());
        version.training_duration_ms = Some(result.duration_ms);
        version.last_error = result.rejection;
        self.repo.put_version(&version)?;

        let entry = state.entry_mut(version.definition_id)?;
        if entry.in_flight == Some(version_id) {
            entry.in_flight = None;
        }
        info!(version = %version_id, status = %version.status, "training result recorded");
        state.versions.insert(version_id, version.clone());
        Ok(version)
    }

    /// `training → failed`, releasing the in-flight slot.
    pub fn fail_training(&self, version_id: VersionId, error: &str) -> EngineResult<ModelVersion> {
        let mut state = self.state.write();
        let mut version = state.version(version_id)?.clone();
        transition(&mut version, VersionStatus::Failed)?;
        version.last_error = Some(error.to_string());
        self.repo.put_version(&version)?;
        let entry = state.entry_mut(version.definition_id)?;
        if entry.in_flight == Some(version_id) {
            entry.in_flight = None;
        }
        warn!(version = %version_id, error, "training failed");
        state.versions.insert(version_id, version.clone());
        Ok(version)
    }

    /// Make a validated version the servable one, demoting the previous active version.
    pub fn promote(&self, version_id: VersionId) -> EngineResult<ModelVersion> {
        self.promote_inner(version_id, None)
    }

    /// Compare-and-swap promotion: fails with `StalePromotion` unless the current
    /// active version is `expected_active`.
    pub fn promote_if(
        &self,
        version_id: VersionId,
        expected_active: Option<VersionId>,
    ) -> EngineResult<ModelVersion> {
        self.promote_inner(version_id, Some(expected_active))
    }

    fn promote_inner(
        &self,
        version_id: VersionId,
        expected: Option<Option<VersionId>>,
    ) -> EngineResult<ModelVersion> {
        let promoted = {
            let mut state = self.state.write();
            let mut candidate = state.version(version_id)?.clone();
            let current = state.entry(candidate.definition_id)?.active;

            if let Some(expected) = expected {
                if expected != current {
                    return Err(EngineError::StalePromotion {
                        version: version_id.raw(),
                        reason: format!("active version is {current:?}, expected {expected:?}"),
                    });
                }
            }

            let previous = match current {
                Some(id) => Some(state.version(id)?.clone()),
                None => None,
            };
            if let Some(prev) = &previous {
                if prev.version > candidate.version && candidate.status == VersionStatus::Validated {
                    transition(&mut candidate, VersionStatus::Rejected)?;
                    candidate.last_error = Some(format!("superseded by active version {}", prev.version));
                    self.repo.put_version(&candidate)?;
                    state.versions.insert(version_id, candidate);
                    return Err(EngineError::StalePromotion {
                        version: version_id.raw(),
                        reason: format!("newer version {} is already active", prev.version),
                    });
                }
            }

            transition(&mut candidate, VersionStatus::Active)?;
            candidate.promoted_ms = Some(time::now_ms());
            candidate.promoted_accuracy = candidate.metrics.as_ref().map(|m| m.accuracy);

            let demoted = match previous {
                Some(mut prev) => {
                    transition(&mut prev, VersionStatus::Deprecated)?;
                    Some(prev)
                }
                None => None,
            };

            let mut rows = Vec::with_capacity(2);
            rows.extend(demoted.iter().cloned());
            rows.push(candidate.clone());
            self.repo.put_versions(&rows)?;

            if let Some(prev) = demoted {
                info!(definition = %prev.definition_id, version = %prev.id, "version deprecated");
                state.versions.insert(prev.id, prev);
            }
            state.entry_mut(candidate.definition_id)?.active = Some(version_id);
            state.versions.insert(version_id, candidate.clone());
            candidate
        };
        info!(definition = %promoted.definition_id, version = %promoted.id, number = promoted.version, "version promoted");
        self.notify(promoted.definition_id, Some(promoted.id));
        Ok(promoted)
    }

    /// `validated → rejected` by operator decision.
    pub fn reject(&self, version_id: VersionId, reason: &str) -> EngineResult<ModelVersion> {
        let mut state = self.state.write();
        let mut version = state.version(version_id)?.clone();
        transition(&mut version, VersionStatus::Rejected)?;
        version.last_error = Some(reason.to_string());
        self.repo.put_version(&version)?;
        state.versions.insert(version_id, version.clone());
        info!(version = %version_id, reason, "version rejected");
        Ok(version)
    }

    /// Withdraw the active version. The definition has no servable model afterwards.
    pub fn deprecate(&self, version_id: VersionId) -> EngineResult<ModelVersion> {
        let version = {
            let mut state = self.state.write();
            let mut version = state.version(version_id)?.clone();
            transition(&mut version, VersionStatus::Deprecated)?;
            self.repo.put_version(&version)?;
            let entry = state.entry_mut(version.definition_id)?;
            if entry.active == Some(version_id) {
                entry.active = None;
            }
            state.versions.insert(version_id, version.clone());
            version
        };
        warn!(definition = %version.definition_id, version = %version_id, "active version withdrawn");
        self.notify(version.definition_id, None);
        Ok(version)
    }

    /// The servable version, if any. Unknown definitions are an error, not `None`.
    pub fn get_active(&self, definition_id: DefinitionId) -> EngineResult<Option<ModelVersion>> {
        let state = self.state.read();
        match state.entry(definition_id)?.active {
            Some(id) => Ok(Some(state.version(id)?.clone())),
            None => Ok(None),
        }
    }

    /// Metrics of the active version, `None` when nothing serves.
    pub fn active_summary(&self, definition_id: DefinitionId) -> EngineResult<Option<ActiveSummary>> {
        let state = self.state.read();
        let entry = state.entry(definition_id)?;
        let Some(id) = entry.active else {
            return Ok(None);
        };
        let v = state.version(id)?;
        Ok(Some(ActiveSummary {
            definition_id,
            definition_name: entry.definition.spec.name.clone(),
            version_id: v.id,
            version: v.version,
            metrics: v.metrics.clone(),
            promoted_accuracy: v.promoted_accuracy,
            promoted_ms: v.promoted_ms,
            training_rows: v.training_rows,
        }))
    }

    pub fn get_version(&self, version_id: VersionId) -> EngineResult<ModelVersion> {
        Ok(self.state.read().version(version_id)?.clone())
    }

    /// Versions of a definition in version-number order, optionally filtered by status.
    pub fn list_versions(
        &self,
        definition_id: DefinitionId,
        status: Option<VersionStatus>,
    ) -> EngineResult<Vec<ModelVersion>> {
        let state = self.state.read();
        let entry = state.entry(definition_id)?;
        Ok(entry
            .versions
            .iter()
            .filter_map(|id| state.versions.get(id))
            .filter(|v| status.map_or(true, |s| v.status == s))
            .cloned()
            .collect())
    }

    /// Version currently being trained for the definition, if any.
    pub fn in_flight(&self, definition_id: DefinitionId) -> EngineResult<Option<VersionId>> {
        Ok(self.state.read().entry(definition_id)?.in_flight)
    }

    /// Freeze a fitted feature set for `definition_id` and return it with its checksum.
    pub fn put_feature_set(
        &self,
        definition_id: DefinitionId,
        feature_set: FeatureSet,
    ) -> EngineResult<Arc<StoredFeatureSet>> {
        let checksum = feature_set.checksum()?;
        let stored = Arc::new(StoredFeatureSet {
            id: FeatureSetId(self.feature_set_ids.next()),
            definition_id,
            checksum,
            feature_set,
        });
        self.repo.put_feature_set(&stored)?;
        self.state.write().feature_sets.insert(stored.id, stored.clone());
        debug!(definition = %definition_id, feature_set = %stored.id, checksum = %format!("{checksum:016x}"), "feature set frozen");
        Ok(stored)
    }

    /// Feature set frozen for training, shared with serving.
    pub fn feature_set(&self, id: FeatureSetId) -> EngineResult<Arc<StoredFeatureSet>> {
        self.state
            .read()
            .feature_sets
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("feature set", id))
    }
}

fn validate_spec(spec: &DefinitionSpec) -> EngineResult<()> {
    if spec.name.trim().is_empty() {
        return Err(EngineError::Config("definition name is empty".into()));
    }
    if spec.features.is_empty() {
        return Err(EngineError::Config(format!("definition `{}` has no features", spec.name)));
    }
    if spec.features.iter().any(|r| r.source == spec.target_column) {
        return Err(EngineError::Config(format!(
            "target column `{}` is also used as a feature",
            spec.target_column
        )));
    }
    if !(spec.tolerance > 0.0) || spec.drift_delta < 0.0 {
        return Err(EngineError::Config(
            "tolerance must be > 0 and drift_delta >= 0".into(),
        ));
    }
    let metric = spec.threshold.metric;
    if !metric.applies_to(spec.problem) {
        return Err(EngineError::Config(format!(
            "threshold metric `{metric}` is never produced for {:?} definitions",
            spec.problem
        )));
    }
    if !spec.threshold.value.is_finite() {
        return Err(EngineError::Config("threshold value must be finite".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::domain::{FeatureRule, RuleKind};
    use crate::evaluation::domain::{MetricName, ProblemKind, PromotionThreshold};
    use crate::training::domain::TaskType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    fn spec(name: &str) -> DefinitionSpec {
        DefinitionSpec::new(
            name,
            TaskType::new("cost"),
            ProblemKind::Regression,
            vec![FeatureRule::new("budget", RuleKind::Standardize)],
            "final_cost",
            "linear_regression",
            PromotionThreshold::at_least(MetricName::Accuracy, 0.0),
        )
    }

    fn result(passed: bool, accuracy: f64) -> TrainingResult {
        TrainingResult {
            metrics: Metrics {
                samples: 10,
                accuracy,
                ..Metrics::default()
            },
            passed,
            rejection: (!passed).then(|| "accuracy below threshold".to_string()),
            artifact: vec![7],
            feature_set_id: FeatureSetId(1),
            feature_set_checksum: 1,
            training_rows: 40,
            duration_ms: 5,
        }
    }

    fn trained(registry: &ModelRegistry, def: DefinitionId) -> VersionId {
        let v = registry.begin_training(def).unwrap();
        registry.record_training_result(v.id, result(true, 0.9)).unwrap();
        v.id
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = ModelRegistry::in_memory();
        registry.register_definition(spec("cost_v1")).unwrap();
        assert!(matches!(
            registry.register_definition(spec("cost_v1")),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn target_cannot_be_a_feature() {
        let mut bad = spec("leaky");
        bad.target_column = "budget".into();
        assert!(ModelRegistry::in_memory().register_definition(bad).is_err());
    }

    #[test]
    fn threshold_metric_must_fit_the_problem() {
        let registry = ModelRegistry::in_memory();
        let mut f1 = spec("cost_f1");
        f1.threshold = PromotionThreshold::at_least(MetricName::F1, 0.7);
        assert!(matches!(registry.register_definition(f1), Err(EngineError::Config(_))));

        let mut rmse = spec("cost_rmse");
        rmse.threshold = PromotionThreshold::at_most(MetricName::Rmse, 1_500.0);
        registry.register_definition(rmse).unwrap();

        let mut risk = spec("risk_v1");
        risk.problem = ProblemKind::Classification;
        risk.threshold = PromotionThreshold::at_most(MetricName::Mae, 0.1);
        assert!(registry.register_definition(risk.clone()).is_err());
        risk.threshold = PromotionThreshold::at_least(MetricName::Recall, 0.6);
        registry.register_definition(risk).unwrap();
        assert_eq!(registry.list_definitions().len(), 2);
    }

    #[test]
    fn concurrent_begin_training_admits_exactly_one() {
        let registry = Arc::new(ModelRegistry::in_memory());
        let def = registry.register_definition(spec("cost_v1")).unwrap().id;
        let barrier = Arc::new(Barrier::new(8));
        let wins = Arc::new(AtomicUsize::new(0));
        let conflicts = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (registry, barrier, wins, conflicts) =
                    (registry.clone(), barrier.clone(), wins.clone(), conflicts.clone());
                thread::spawn(move || {
                    barrier.wait();
                    match registry.begin_training(def) {
                        Ok(_) => wins.fetch_add(1, Ordering::SeqCst),
                        Err(EngineError::TrainingInProgress { .. }) => {
                            conflicts.fetch_add(1, Ordering::SeqCst)
                        }
                        Err(other) => panic!("unexpected {other}"),
                    };
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert_eq!(conflicts.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn promotion_swaps_active_atomically() {
        let registry = ModelRegistry::in_memory();
        let def = registry.register_definition(spec("cost_v1")).unwrap().id;
        let v1 = trained(&registry, def);
        registry.promote(v1).unwrap();
        let v2 = trained(&registry, def);
        registry.promote(v2).unwrap();

        assert_eq!(registry.get_active(def).unwrap().unwrap().id, v2);
        assert_eq!(registry.get_version(v1).unwrap().status, VersionStatus::Deprecated);
        let active = registry.list_versions(def, Some(VersionStatus::Active)).unwrap();
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn readers_never_see_zero_or_two_active_during_promotions() {
        let registry = Arc::new(ModelRegistry::in_memory());
        let def = registry.register_definition(spec("cost_v1")).unwrap().id;
        let first = trained(&registry, def);
        registry.promote(first).unwrap();

        let reader = {
            let registry = registry.clone();
            thread::spawn(move || {
                for _ in 0..2_000 {
                    assert!(registry.get_active(def).unwrap().is_some());
                    let n = registry
                        .list_versions(def, Some(VersionStatus::Active))
                        .unwrap()
                        .len();
                    assert_eq!(n, 1);
                }
            })
        };
        for _ in 0..50 {
            let v = trained(&registry, def);
            registry.promote(v).unwrap();
        }
        reader.join().unwrap();
    }

    #[test]
    fn failed_threshold_is_rejected_and_keeps_prior_active() {
        let registry = ModelRegistry::in_memory();
        let def = registry.register_definition(spec("cost_v1")).unwrap().id;
        let v1 = trained(&registry, def);
        registry.promote(v1).unwrap();

        let v2 = registry.begin_training(def).unwrap();
        let recorded = registry.record_training_result(v2.id, result(false, 0.2)).unwrap();
        assert_eq!(recorded.status, VersionStatus::Rejected);
        assert_eq!(registry.get_active(def).unwrap().unwrap().id, v1);
        assert!(registry.in_flight(def).unwrap().is_none());
    }

    #[test]
    fn cannot_promote_unvalidated_versions() {
        let registry = ModelRegistry::in_memory();
        let def = registry.register_definition(spec("cost_v1")).unwrap().id;
        let v = registry.begin_training(def).unwrap();
        assert!(matches!(
            registry.promote(v.id),
            Err(EngineError::InvalidTransition { .. })
        ));
        registry.fail_training(v.id, "boom").unwrap();
        assert!(matches!(
            registry.promote(v.id),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn compare_and_swap_detects_stale_expectation() {
        let registry = ModelRegistry::in_memory();
        let def = registry.register_definition(spec("cost_v1")).unwrap().id;
        let v1 = trained(&registry, def);
        registry.promote_if(v1, None).unwrap();
        let v2 = trained(&registry, def);
        let err = registry.promote_if(v2, None).unwrap_err();
        assert!(matches!(err, EngineError::StalePromotion { .. }));
        registry.promote_if(v2, Some(v1)).unwrap();
    }

    #[test]
    fn older_candidate_cannot_replace_newer_active() {
        let registry = ModelRegistry::in_memory();
        let def = registry.register_definition(spec("cost_v1")).unwrap().id;
        let older = trained(&registry, def);
        let newer = trained(&registry, def);
        registry.promote(newer).unwrap();
        assert!(matches!(
            registry.promote(older),
            Err(EngineError::StalePromotion { .. })
        ));
        assert_eq!(registry.get_version(older).unwrap().status, VersionStatus::Rejected);
        assert_eq!(registry.get_active(def).unwrap().unwrap().id, newer);
    }

    #[test]
    fn deprecate_withdraws_and_notifies() {
        let registry = ModelRegistry::in_memory();
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            registry.on_active_change(Arc::new(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let def = registry.register_definition(spec("cost_v1")).unwrap().id;
        let v = trained(&registry, def);
        registry.promote(v).unwrap();
        registry.deprecate(v).unwrap();
        assert!(registry.get_active(def).unwrap().is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_definition_is_not_found() {
        let registry = ModelRegistry::in_memory();
        assert!(matches!(
            registry.get_active(DefinitionId(42)),
            Err(EngineError::NotFound { .. })
        ));
    }

    /// Memory repo whose batch writes can be switched to fail.
    #[derive(Default)]
    struct BrokenBatchRepo {
        inner: MemoryRepo,
        fail_batches: std::sync::atomic::AtomicBool,
    }

    impl RegistryRepo for BrokenBatchRepo {
        fn put_definition(&self, definition: &ModelDefinition) -> EngineResult<()> {
            self.inner.put_definition(definition)
        }
        fn put_version(&self, version: &ModelVersion) -> EngineResult<()> {
            self.inner.put_version(version)
        }
        fn put_versions(&self, versions: &[ModelVersion]) -> EngineResult<()> {
            if self.fail_batches.load(Ordering::SeqCst) {
                return Err(EngineError::Storage("disk full".into()));
            }
            self.inner.put_versions(versions)
        }
        fn put_job(&self, job: &crate::training::domain::TrainingJob) -> EngineResult<()> {
            self.inner.put_job(job)
        }
        fn put_feature_set(&self, feature_set: &StoredFeatureSet) -> EngineResult<()> {
            self.inner.put_feature_set(feature_set)
        }
        fn put_prediction(
            &self,
            record: &crate::monitoring::domain::PredictionRecord,
        ) -> EngineResult<()> {
            self.inner.put_prediction(record)
        }
        fn remove_prediction(&self, id: crate::common::ids::PredictionId) -> EngineResult<()> {
            self.inner.remove_prediction(id)
        }
        fn load(&self) -> EngineResult<RepoSnapshot> {
            self.inner.load()
        }
    }

    #[test]
    fn failed_promotion_write_leaves_memory_and_storage_agreeing() {
        let repo = Arc::new(BrokenBatchRepo::default());
        let (registry, _) = ModelRegistry::open(repo.clone()).unwrap();
        let def = registry.register_definition(spec("cost_v1")).unwrap().id;
        let v1 = trained(&registry, def);
        registry.promote(v1).unwrap();
        let v2 = trained(&registry, def);

        repo.fail_batches.store(true, Ordering::SeqCst);
        assert!(matches!(registry.promote(v2), Err(EngineError::Storage(_))));

        assert_eq!(registry.get_active(def).unwrap().map(|v| v.id), Some(v1));
        assert_eq!(registry.get_version(v2).unwrap().status, VersionStatus::Validated);
        let stored = repo.load().unwrap();
        let status_of = |id: VersionId| stored.versions.iter().find(|v| v.id == id).unwrap().status;
        assert_eq!(status_of(v1), VersionStatus::Active);
        assert_eq!(status_of(v2), VersionStatus::Validated);

        let (reopened, _) = ModelRegistry::open(repo.clone()).unwrap();
        assert_eq!(reopened.get_active(def).unwrap().map(|v| v.id), Some(v1));

        repo.fail_batches.store(false, Ordering::SeqCst);
        registry.promote(v2).unwrap();
        let stored = repo.load().unwrap();
        let active: Vec<_> = stored
            .versions
            .iter()
            .filter(|v| v.status == VersionStatus::Active)
            .map(|v| v.id)
            .collect();
        assert_eq!(active, vec![v2]);
    }

    #[test]
    fn reopen_restores_state_and_id_counters() {
        let repo: Arc<dyn RegistryRepo> = Arc::new(MemoryRepo::new());
        let (registry, _) = ModelRegistry::open(repo.clone()).unwrap();
        let def = registry.register_definition(spec("cost_v1")).unwrap().id;
        let v1 = trained(&registry, def);
        registry.promote(v1).unwrap();
        let pending = registry.begin_training(def).unwrap();

        let (reopened, _) = ModelRegistry::open(repo).unwrap();
        assert_eq!(reopened.get_active(def).unwrap().unwrap().id, v1);
        assert_eq!(reopened.in_flight(def).unwrap(), Some(pending.id));
        let other = reopened.register_definition(spec("timeline_v1")).unwrap();
        assert_ne!(other.id, def);
    }
}
