//! The engine facade handed to hosting layers.
//!
//! Wires registry, orchestrator, prediction service and monitor together over one
//! repository. Every method maps to one operation a host exposes: registry queries,
//! training triggers, prediction and outcome feedback.

use std::sync::Arc;

use tracing::info;

use crate::common::config::EngineConfig;
use crate::common::error::{EngineError, EngineResult};
use crate::common::ids::{DefinitionId, JobId, PredictionId, VersionId};
use crate::common::log;
use crate::data::domain::{DataSource, Record};
use crate::inference::domain::Prediction;
use crate::inference::service::PredictionService;
use crate::monitoring::domain::{AccuracySummary, DriftSignal, PredictionRecord, Window};
use crate::monitoring::service::{Monitor, PredictionLog};
use crate::training::algorithms::AlgorithmCatalog;
use crate::training::domain::{
    DefinitionSpec, Hyperparameters, ModelDefinition, ModelVersion, RegistryRepo, TrainingJob,
    VersionStatus,
};
use crate::training::orchestrator::TrainingOrchestrator;
use crate::training::registry::{ActiveSummary, ModelRegistry};
use crate::training::repo_fs::FsRegistryRepo;
use crate::training::repo_mem::MemoryRepo;

/// Version of the facade's observable behaviour, bumped on breaking changes.
pub const API_VERSION: u32 = 1;

pub struct Engine {
    // Declared first so workers are joined before anything they use is dropped.
    orchestrator: TrainingOrchestrator,
    predictions: PredictionService,
    monitor: Monitor,
    registry: Arc<ModelRegistry>,
    catalog: Arc<AlgorithmCatalog>,
    cfg: EngineConfig,
}

impl Engine {
    /// Durable engine persisting under `cfg.data_root`.
    pub fn open(cfg: EngineConfig, source: Arc<dyn DataSource>) -> EngineResult<Self> {
        let repo = Arc::new(FsRegistryRepo::new(&cfg)?);
        Self::with_parts(cfg, source, repo, AlgorithmCatalog::with_defaults())
    }

    /// Engine whose state lives only as long as the process.
    pub fn in_memory(cfg: EngineConfig, source: Arc<dyn DataSource>) -> EngineResult<Self> {
        Self::with_parts(
            cfg,
            source,
            Arc::new(MemoryRepo::new()),
            AlgorithmCatalog::with_defaults(),
        )
    }

    /// Assemble an engine from explicit parts, e.g. a catalog with extra algorithms.
    pub fn with_parts(
        cfg: EngineConfig,
        source: Arc<dyn DataSource>,
        repo: Arc<dyn RegistryRepo>,
        catalog: AlgorithmCatalog,
    ) -> EngineResult<Self> {
        cfg.validate()?;
        log::init(&cfg.log);

        let (registry, snapshot) = ModelRegistry::open(repo.clone())?;
        let registry = Arc::new(registry);
        let catalog = Arc::new(catalog);

        let log = Arc::new(PredictionLog::new(repo, cfg.monitoring.retention));
        log.restore(snapshot.predictions)?;
        let predictions = PredictionService::new(registry.clone(), catalog.clone(), log.clone(), &cfg.serving);
        let monitor = Monitor::new(registry.clone(), log, cfg.monitoring.clone());
        let orchestrator = TrainingOrchestrator::start(
            registry.clone(),
            catalog.clone(),
            source,
            cfg.training.clone(),
            cfg.sample_data.clone(),
            snapshot.jobs,
        )?;

        info!(
            api_version = API_VERSION,
            definitions = registry.list_definitions().len(),
            workers = orchestrator.workers(),
            "engine ready"
        );
        Ok(Self {
            orchestrator,
            predictions,
            monitor,
            registry,
            catalog,
            cfg,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    // Registry queries and operator actions.

    /// Register a definition after checking its algorithm is in the catalog.
    pub fn register_definition(&self, spec: DefinitionSpec) -> EngineResult<ModelDefinition> {
        if !self.catalog.contains(&spec.algorithm) {
            return Err(EngineError::Config(format!(
                "unknown algorithm `{}`",
                spec.algorithm
            )));
        }
        self.registry.register_definition(spec)
    }

    pub fn definition(&self, id: DefinitionId) -> EngineResult<ModelDefinition> {
        self.registry.definition(id)
    }

    pub fn definition_by_name(&self, name: &str) -> EngineResult<ModelDefinition> {
        self.registry.definition_by_name(name)
    }

    pub fn list_definitions(&self) -> Vec<ModelDefinition> {
        self.registry.list_definitions()
    }

    pub fn list_versions(
        &self,
        definition_id: DefinitionId,
        status: Option<VersionStatus>,
    ) -> EngineResult<Vec<ModelVersion>> {
        self.registry.list_versions(definition_id, status)
    }

    pub fn get_version(&self, version_id: VersionId) -> EngineResult<ModelVersion> {
        self.registry.get_version(version_id)
    }

    pub fn get_active(&self, definition_id: DefinitionId) -> EngineResult<Option<ModelVersion>> {
        self.registry.get_active(definition_id)
    }

    /// Metrics of the servable version; `None` reads as "insight unavailable".
    pub fn active_summary(&self, definition_id: DefinitionId) -> EngineResult<Option<ActiveSummary>> {
        self.registry.active_summary(definition_id)
    }

    /// Promote a validated version if the active one is still `expected_active`.
    pub fn promote_if(
        &self,
        version_id: VersionId,
        expected_active: Option<VersionId>,
    ) -> EngineResult<ModelVersion> {
        self.registry.promote_if(version_id, expected_active)
    }

    /// Operator rejection of a validated version.
    pub fn reject(&self, version_id: VersionId, reason: &str) -> EngineResult<ModelVersion> {
        self.registry.reject(version_id, reason)
    }

    /// Retire the active version; the definition stops serving until the next promotion.
    pub fn deprecate(&self, version_id: VersionId) -> EngineResult<ModelVersion> {
        self.registry.deprecate(version_id)
    }

    // Training.

    /// Queue a training job. Fails with `Conflict` while another version is in flight.
    pub fn submit_training(
        &self,
        definition_id: DefinitionId,
        hyperparameters: Hyperparameters,
    ) -> EngineResult<TrainingJob> {
        self.orchestrator.submit(definition_id, hyperparameters)
    }

    /// Cancel a queued or running job; running jobs stop at their next checkpoint.
    pub fn cancel_training(&self, job_id: JobId) -> EngineResult<TrainingJob> {
        self.orchestrator.cancel(job_id)
    }

    pub fn poll_training(&self, job_id: JobId) -> EngineResult<TrainingJob> {
        self.orchestrator.poll(job_id)
    }

    pub fn list_jobs(&self, definition_id: Option<DefinitionId>) -> Vec<TrainingJob> {
        self.orchestrator.list_jobs(definition_id)
    }

    pub fn jobs_for_version(&self, version_id: VersionId) -> Vec<TrainingJob> {
        self.orchestrator.jobs_for_version(version_id)
    }

    // Serving.

    /// Serve one prediction from the active version.
    pub fn predict(&self, definition_id: DefinitionId, input: &Record) -> EngineResult<Prediction> {
        self.predictions.predict(definition_id, input)
    }

    /// Serve many inputs against one active version; each row carries its own result.
    pub fn predict_batch(
        &self,
        definition_id: DefinitionId,
        inputs: &[Record],
    ) -> EngineResult<Vec<EngineResult<Prediction>>> {
        self.predictions.predict_batch(definition_id, inputs)
    }

    /// Share of predictions answered from the cache since start.
    pub fn cache_hit_rate(&self) -> f64 {
        self.predictions.cache().hit_rate()
    }

    // Monitoring.

    /// Attach the observed value to a served prediction.
    pub fn record_outcome(
        &self,
        prediction_id: PredictionId,
        ground_truth: f64,
    ) -> EngineResult<PredictionRecord> {
        self.monitor.record_outcome(prediction_id, ground_truth)
    }

    pub fn prediction(&self, prediction_id: PredictionId) -> EngineResult<PredictionRecord> {
        self.monitor.log().get(prediction_id)
    }

    /// Accuracy over every version of the definition.
    pub fn window_accuracy(
        &self,
        definition_id: DefinitionId,
        window: Window,
    ) -> EngineResult<AccuracySummary> {
        self.monitor.window_accuracy(definition_id, None, window)
    }

    /// Accuracy of one version's predictions within `window`.
    pub fn version_window_accuracy(
        &self,
        definition_id: DefinitionId,
        version_id: VersionId,
        window: Window,
    ) -> EngineResult<AccuracySummary> {
        self.monitor.window_accuracy(definition_id, Some(version_id), window)
    }

    /// Compare live accuracy of the active version with its promotion-time accuracy.
    pub fn check_drift(&self, definition_id: DefinitionId) -> EngineResult<DriftSignal> {
        self.monitor.check_drift(definition_id)
    }

    /// Stop the workers, letting running jobs reach their next checkpoint.
    pub fn shutdown(self) {
        info!("engine shutting down");
        drop(self);
    }
}
