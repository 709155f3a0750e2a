//! Training orchestration: a bounded queue of jobs consumed by a fixed worker pool.
//!
//! A job runs feature fitting, training and evaluation, then writes the outcome
//! back to the registry. Transient failures are retried with exponential backoff,
//! each retry being a fresh job on the same version. Job rows are persisted on
//! every change so a restarted process can re-queue or retry them.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam::channel::{bounded, Sender, TrySendError};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::common::config::{SampleDataMode, TrainingCfg};
use crate::common::error::{DataError, EngineError, EngineResult};
use crate::common::ids::{DefinitionId, IdGenerator, JobId, VersionId};
use crate::common::time;
use crate::data::domain::{DataSource, Record};
use crate::data::service::{
    augment_with_samples, build_features, extract_targets, fit_feature_set, select, split_holdout,
};
use crate::evaluation::service::evaluate;

use super::algorithms::{AlgorithmCatalog, TrainingControl};
use super::domain::{
    Hyperparameters, JobStatus, ModelDefinition, ModelVersion, TrainingJob, TrainingResult,
    VersionStatus,
};
use super::registry::ModelRegistry;
use super::workers::WorkerPool;

struct OrchestratorCore {
    registry: Arc<ModelRegistry>,
    catalog: Arc<AlgorithmCatalog>,
    source: Arc<dyn DataSource>,
    cfg: TrainingCfg,
    sample_data: SampleDataMode,
    jobs: RwLock<HashMap<JobId, TrainingJob>>,
    cancel_flags: DashMap<JobId, Arc<AtomicBool>>,
    job_ids: IdGenerator,
    tx: Sender<JobId>,
    shutdown: Arc<AtomicBool>,
}

pub struct TrainingOrchestrator {
    // Dropped first: stops and joins the workers.
    pool: WorkerPool,
    core: Arc<OrchestratorCore>,
}

impl TrainingOrchestrator {
    /// Start the worker pool. `recovered` are job rows loaded from the repository.
    pub fn start(
        registry: Arc<ModelRegistry>,
        catalog: Arc<AlgorithmCatalog>,
        source: Arc<dyn DataSource>,
        cfg: TrainingCfg,
        sample_data: SampleDataMode,
        recovered: Vec<TrainingJob>,
    ) -> EngineResult<Self> {
        let (tx, rx) = bounded(cfg.queue_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let core = Arc::new(OrchestratorCore {
            registry,
            catalog,
            source,
            cfg,
            sample_data,
            jobs: RwLock::new(HashMap::new()),
            cancel_flags: DashMap::new(),
            job_ids: IdGenerator::new(),
            tx,
            shutdown: shutdown.clone(),
        });

        let handler = {
            let core = core.clone();
            Arc::new(move |worker: usize, job: JobId| core.run_job(worker, job))
        };
        let pool = WorkerPool::spawn("trainer", core.cfg.workers, rx, shutdown, handler)?;
        info!(workers = pool.size(), capacity = core.cfg.queue_capacity, "training orchestrator started");

        core.recover(recovered)?;
        Ok(Self { pool, core })
    }

    /// Queue a training run. Fails fast with `TrainingInProgress` if the definition
    /// already has a version in training.
    pub fn submit(
        &self,
        definition_id: DefinitionId,
        hyperparameters: Hyperparameters,
    ) -> EngineResult<TrainingJob> {
        let definition = self.core.registry.definition(definition_id)?;
        self.core.catalog.get(&definition.spec.algorithm)?;
        let version = self.core.registry.begin_training(definition_id)?;

        let job = TrainingJob {
            id: JobId(self.core.job_ids.next()),
            definition_id,
            version_id: version.id,
            hyperparameters,
            status: JobStatus::Queued,
            attempt: 1,
            retry_of: None,
            worker: None,
            submitted_ms: time::now_ms(),
            started_ms: None,
            finished_ms: None,
            last_error: None,
        };
        if let Err(err) = self.core.insert_job(job.clone()) {
            self.core.release_version(version.id, &err.to_string());
            return Err(err);
        }

        if let Err(err) = self.core.enqueue(job.id) {
            self.core.abandon(&job, &err.to_string());
            return Err(err);
        }
        info!(job = %job.id, definition = %definition_id, version = %version.id, "training job queued");
        Ok(job)
    }

    /// Cooperative cancellation. Queued jobs never start; running jobs stop at their
    /// next checkpoint. Cancelling a finished job is a no-op.
    pub fn cancel(&self, job_id: JobId) -> EngineResult<TrainingJob> {
        let (job, was_queued) = {
            let mut jobs = self.core.jobs.write();
            let job = jobs
                .get_mut(&job_id)
                .ok_or_else(|| EngineError::not_found("job", job_id))?;
            if job.status.is_terminal() {
                debug!(job = %job_id, status = ?job.status, "cancel ignored for finished job");
                return Ok(job.clone());
            }
            let was_queued = job.status == JobStatus::Queued;
            self.core.flag(job_id).store(true, Ordering::Release);
            job.status = JobStatus::Cancelled;
            job.finished_ms = Some(time::now_ms());
            self.core.registry.repo().put_job(job)?;
            (job.clone(), was_queued)
        };

        if was_queued {
            self.core.release_version(job.version_id, "cancelled before start");
            self.core.cancel_flags.remove(&job_id);
        }
        info!(job = %job_id, "training job cancelled");
        Ok(job)
    }

    /// Current state of a job.
    pub fn poll(&self, job_id: JobId) -> EngineResult<TrainingJob> {
        self.core
            .jobs
            .read()
            .get(&job_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("job", job_id))
    }

    /// Jobs in submission order, optionally for one definition.
    pub fn list_jobs(&self, definition_id: Option<DefinitionId>) -> Vec<TrainingJob> {
        let mut jobs: Vec<_> = self
            .core
            .jobs
            .read()
            .values()
            .filter(|j| definition_id.map_or(true, |d| j.definition_id == d))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    /// Every attempt made for a version, first to last.
    pub fn jobs_for_version(&self, version_id: VersionId) -> Vec<TrainingJob> {
        let mut jobs: Vec<_> = self
            .core
            .jobs
            .read()
            .values()
            .filter(|j| j.version_id == version_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.attempt);
        jobs
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.pool.size()
    }
}

impl OrchestratorCore {
    fn flag(&self, job: JobId) -> Arc<AtomicBool> {
        self.cancel_flags
            .entry(job)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    fn insert_job(&self, job: TrainingJob) -> EngineResult<()> {
        self.registry.repo().put_job(&job)?;
        self.jobs.write().insert(job.id, job);
        Ok(())
    }

    /// Apply `f` unless the job is already terminal. Returns the updated row.
    fn update_job(&self, id: JobId, f: impl FnOnce(&mut TrainingJob)) -> Option<TrainingJob> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&id)?;
        if job.status.is_terminal() {
            return None;
        }
        f(job);
        if let Err(err) = self.registry.repo().put_job(job) {
            error!(job = %id, error = %err, "failed to persist job row");
        }
        Some(job.clone())
    }

    fn enqueue(&self, job: JobId) -> EngineResult<()> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(EngineError::QueueFull {
                capacity: self.cfg.queue_capacity,
            }),
            Err(TrySendError::Disconnected(_)) => {
                Err(EngineError::Storage("training queue is closed".into()))
            }
        }
    }

    /// Mark a job that never ran as failed and free its version.
    fn abandon(&self, job: &TrainingJob, reason: &str) {
        self.update_job(job.id, |j| {
            j.status = JobStatus::Failed;
            j.finished_ms = Some(time::now_ms());
            j.last_error = Some(reason.to_string());
        });
        self.release_version(job.version_id, reason);
    }

    /// Fail the version if it is still training.
    fn release_version(&self, version: VersionId, reason: &str) {
        match self.registry.get_version(version) {
            Ok(v) if v.status == VersionStatus::Training => {
                if let Err(err) = self.registry.fail_training(version, reason) {
                    error!(version = %version, error = %err, "could not mark version failed");
                }
            }
            Ok(_) => {}
            Err(err) => error!(version = %version, error = %err, "version lookup failed"),
        }
    }

    fn run_job(&self, worker: usize, job_id: JobId) {
        let Some(job) = self.update_job(job_id, |j| {
            if j.status == JobStatus::Queued {
                j.status = JobStatus::Running;
                j.worker = Some(worker);
                j.started_ms = Some(time::now_ms());
            }
        }) else {
            debug!(job = %job_id, "skipping job that is no longer queued");
            return;
        };
        if job.status != JobStatus::Running {
            return;
        }

        let flag = self.flag(job_id);
        let outcome = self.registry.definition(job.definition_id).and_then(|definition| {
            let budget_ms = definition
                .spec
                .max_training_secs
                .map(|s| s.saturating_mul(1_000))
                .unwrap_or_else(|| self.cfg.max_duration().as_millis() as u64);
            let control = TrainingControl::new(job_id, flag, budget_ms);
            info!(job = %job_id, worker, attempt = job.attempt, budget_ms, "training job running");
            panic::catch_unwind(AssertUnwindSafe(|| self.train(&job, &definition, &control)))
                .unwrap_or_else(|payload| {
                    let msg = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    Err(EngineError::transient(format!("worker crashed: {msg}")))
                })
        });
        self.finish(job, outcome);
        self.cancel_flags.remove(&job_id);
    }

    fn snapshot(&self, definition: &ModelDefinition) -> EngineResult<Vec<Record>> {
        let mut records = self.source.snapshot(&definition.spec.name).map_err(|err| match err {
            EngineError::Data(_) | EngineError::NotFound { .. } | EngineError::Training { .. } => err,
            other => EngineError::transient(format!("data source: {other}")),
        })?;

        let required = self.cfg.min_training_rows.max(2);
        if records.len() < required {
            match &self.sample_data {
                SampleDataMode::Synthetic { target_rows, seed } if !records.is_empty() => {
                    warn!(
                        definition = %definition.id,
                        real_rows = records.len(),
                        "snapshot below minimum, training on synthetic sample data"
                    );
                    records = augment_with_samples(&records, (*target_rows).max(required), *seed);
                }
                _ => {
                    return Err(DataError::InsufficientRows {
                        required,
                        found: records.len(),
                    }
                    .into())
                }
            }
        }
        Ok(records)
    }

    fn train(
        &self,
        job: &TrainingJob,
        definition: &ModelDefinition,
        control: &TrainingControl,
    ) -> EngineResult<ModelVersion> {
        let started = Instant::now();
        let spec = &definition.spec;
        let algorithm = self.catalog.get(&spec.algorithm)?;
        let version = self.registry.get_version(job.version_id)?;
        control.checkpoint()?;

        let records = self.snapshot(definition)?;
        let params = spec.hyperparameters.merged(&job.hyperparameters);
        let seed = params
            .get("seed")
            .map(|s| s as u64)
            .unwrap_or(self.cfg.split_seed);
        let (train_idx, held_idx) = split_holdout(records.len(), self.cfg.holdout_fraction, seed);
        let train_rows = select(&records, &train_idx);
        let held_rows = select(&records, &held_idx);

        let feature_set = fit_feature_set(&spec.name, version.version, &train_rows, &spec.features)?;
        let x_train = build_features(&train_rows, &feature_set)?;
        let y_train = extract_targets(&train_rows, &spec.target_column)?;
        let x_held = build_features(&held_rows, &feature_set)?;
        let y_held = extract_targets(&held_rows, &spec.target_column)?;
        control.checkpoint()?;

        let artifact = algorithm.fit(&x_train, &y_train, &params, control)?;
        let evaluation = evaluate(
            algorithm.as_ref(),
            &artifact,
            &x_held,
            &y_held,
            spec.problem,
            spec.tolerance,
            &spec.threshold,
        )?;
        debug!(
            job = %job.id,
            accuracy = ?evaluation.metrics.accuracy,
            observed = evaluation.observed,
            passed = evaluation.passed,
            "evaluation finished"
        );

        // Last safe point: nothing has been written to the registry yet.
        control.checkpoint()?;
        let rejection = (!evaluation.passed).then(|| EngineError::EvaluationRejected {
            version: job.version_id.raw(),
            metric: spec.threshold.metric.to_string(),
            observed: evaluation.observed,
        });
        let stored = self.registry.put_feature_set(definition.id, feature_set)?;
        let recorded = self.registry.record_training_result(
            job.version_id,
            TrainingResult {
                metrics: evaluation.metrics.clone(),
                passed: evaluation.passed,
                rejection: rejection.as_ref().map(ToString::to_string),
                artifact,
                feature_set_id: stored.id,
                feature_set_checksum: stored.checksum,
                training_rows: train_rows.len(),
                duration_ms: started.elapsed().as_millis() as u64,
            },
        )?;

        if !evaluation.passed {
            info!(
                job = %job.id,
                version = %job.version_id,
                metric = %spec.threshold.metric,
                observed = evaluation.observed,
                threshold = spec.threshold.value,
                "version rejected by promotion threshold"
            );
            return Ok(recorded);
        }
        match self.registry.promote(job.version_id) {
            Ok(promoted) => Ok(promoted),
            Err(EngineError::StalePromotion { reason, .. }) => {
                warn!(job = %job.id, version = %job.version_id, reason = %reason, "promotion was stale");
                self.registry.get_version(job.version_id)
            }
            Err(err) => {
                self.settle_unpromoted(job.version_id, &err);
                Err(err)
            }
        }
    }

    /// A validated version whose promotion failed must not stay `validated`: reject it.
    /// If even that write fails, `recover` settles it on the next start.
    fn settle_unpromoted(&self, version: VersionId, err: &EngineError) {
        let reason = format!("promotion failed: {err}");
        match self.registry.reject(version, &reason) {
            Ok(_) => warn!(version = %version, error = %err, "promotion failed, version rejected"),
            Err(reject_err) => error!(
                version = %version,
                error = %err,
                reject_error = %reject_err,
                "promotion failed and the version could not be rejected"
            ),
        }
    }

    fn finish(&self, job: TrainingJob, outcome: EngineResult<ModelVersion>) {
        let elapsed_ms = job
            .started_ms
            .map(|s| time::now_ms().saturating_sub(s))
            .unwrap_or_default();
        match outcome {
            Ok(version) => {
                let updated = self.update_job(job.id, |j| {
                    j.status = JobStatus::Succeeded;
                    j.finished_ms = Some(time::now_ms());
                });
                if updated.is_none() {
                    warn!(job = %job.id, "job was cancelled after its result was recorded");
                }
                info!(job = %job.id, version = %version.id, status = %version.status, elapsed_ms, "training job succeeded");
            }
            Err(EngineError::Cancelled(_)) => {
                self.update_job(job.id, |j| {
                    j.status = JobStatus::Cancelled;
                    j.finished_ms = Some(time::now_ms());
                });
                self.release_version(job.version_id, "cancelled");
                info!(job = %job.id, elapsed_ms, "training job stopped at checkpoint after cancel");
            }
            Err(err) => {
                let message = err.to_string();
                let updated = self.update_job(job.id, |j| {
                    j.status = JobStatus::Failed;
                    j.finished_ms = Some(time::now_ms());
                    j.last_error = Some(message.clone());
                });
                if updated.is_none() {
                    // Cancelled while running; a cancelled job is never retried.
                    self.release_version(job.version_id, "cancelled");
                    return;
                }
                let still_training = matches!(
                    self.registry.get_version(job.version_id),
                    Ok(v) if v.status == VersionStatus::Training
                );
                if err.is_transient()
                    && still_training
                    && job.attempt < self.cfg.max_attempts
                    && !self.shutdown.load(Ordering::Acquire)
                {
                    self.schedule_retry(&job, &message);
                } else {
                    warn!(job = %job.id, attempt = job.attempt, error = %message, transient = err.is_transient(), "training job failed");
                    self.release_version(job.version_id, &message);
                }
            }
        }
    }

    fn schedule_retry(&self, failed: &TrainingJob, error: &str) {
        let retry = TrainingJob {
            id: JobId(self.job_ids.next()),
            status: JobStatus::Queued,
            attempt: failed.attempt + 1,
            retry_of: Some(failed.id),
            worker: None,
            submitted_ms: time::now_ms(),
            started_ms: None,
            finished_ms: None,
            last_error: None,
            ..failed.clone()
        };
        if let Err(err) = self.insert_job(retry.clone()) {
            error!(job = %failed.id, error = %err, "could not persist retry job");
            self.release_version(failed.version_id, error);
            return;
        }

        let delay = self.cfg.backoff(failed.attempt);
        warn!(
            job = %failed.id,
            retry = %retry.id,
            attempt = retry.attempt,
            delay_ms = delay.as_millis() as u64,
            error,
            "transient training failure, retrying"
        );

        let tx = self.tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("retry-{}", retry.id.raw()))
            .spawn(move || {
                thread::sleep(delay);
                if tx.send(retry.id).is_err() {
                    debug!(job = %retry.id, "queue closed before retry could be sent");
                }
            });
        if let Err(err) = spawned {
            self.abandon(&retry, &format!("could not schedule retry: {err}"));
        }
    }

    /// Re-queue jobs from a previous process, retry the ones that were running when it
    /// died and fail versions left training without a live job.
    fn recover(&self, recovered: Vec<TrainingJob>) -> EngineResult<()> {
        if recovered.is_empty() && self.registry.list_definitions().is_empty() {
            return Ok(());
        }
        let mut requeue = Vec::new();
        let mut orphaned = Vec::new();
        {
            let mut jobs = self.jobs.write();
            for job in recovered {
                self.job_ids.observe(job.id.raw());
                match job.status {
                    JobStatus::Queued => requeue.push(job.id),
                    JobStatus::Running => orphaned.push(job.clone()),
                    _ => {}
                }
                jobs.insert(job.id, job);
            }
        }

        for job in orphaned {
            warn!(job = %job.id, "job was running when the previous process stopped");
            self.finish(job, Err(EngineError::transient("worker lost during restart")));
        }
        for id in requeue {
            if let Err(err) = self.enqueue(id) {
                let job = self.jobs.read().get(&id).cloned();
                if let Some(job) = job {
                    self.abandon(&job, &err.to_string());
                }
            }
        }

        self.settle_validated()?;

        let live: Vec<VersionId> = self
            .jobs
            .read()
            .values()
            .filter(|j| !j.status.is_terminal())
            .map(|j| j.version_id)
            .collect();
        for definition in self.registry.list_definitions() {
            if let Some(version) = self.registry.in_flight(definition.id)? {
                if !live.contains(&version) {
                    warn!(definition = %definition.id, version = %version, "training version has no job, failing it");
                    self.release_version(version, "orphaned by restart");
                }
            }
        }
        Ok(())
    }

    /// Versions stop in `validated` only when the process died (or storage failed)
    /// between evaluation and promotion. Their evaluation passed, so the newest one
    /// is promoted; older ones are rejected as superseded.
    fn settle_validated(&self) -> EngineResult<()> {
        for definition in self.registry.list_definitions() {
            let validated = self
                .registry
                .list_versions(definition.id, Some(VersionStatus::Validated))?;
            let Some((newest, older)) = validated.split_last() else {
                continue;
            };
            for version in older {
                if let Err(err) = self.registry.reject(version.id, "superseded before promotion") {
                    error!(version = %version.id, error = %err, "could not reject stale validated version");
                }
            }
            match self.registry.promote(newest.id) {
                Ok(_) => info!(definition = %definition.id, version = %newest.id, "promoted validated version left by previous process"),
                Err(EngineError::StalePromotion { reason, .. }) => {
                    warn!(version = %newest.id, reason = %reason, "validated version was stale")
                }
                Err(err) => self.settle_unpromoted(newest.id, &err),
            }
        }
        Ok(())
    }
}
