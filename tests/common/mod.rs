#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use std::sync::atomic::AtomicBool;

use forecast_core::data::FeatureMatrix;
use forecast_core::monitoring::PredictionRecord;
use forecast_core::training::domain::{RepoSnapshot, StoredFeatureSet};
use forecast_core::training::{
    Inference, MemoryRepo, ModelDefinition, ModelVersion, Predictor, RegistryRepo,
    TrainingControl,
};
use forecast_core::{
    Algorithm, DataSource, DefinitionSpec, Engine, EngineConfig, EngineError, EngineResult,
    FeatureRule, Hyperparameters, JobId, MemoryDataSource, MetricName, PredictionId, ProblemKind,
    PromotionThreshold, Record, RuleKind, TaskType, TrainingJob, VersionId, VersionStatus,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const WAIT: Duration = Duration::from_secs(20);

/// Small, fast configuration for scenario tests.
pub fn test_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.training.workers = 2;
    cfg.training.backoff_base_ms = 10;
    cfg.training.backoff_max_ms = 50;
    cfg.log.level = "debug".into();
    cfg
}

const REGIONS: [&str; 3] = ["north", "south", "coast"];

/// Project rows where `final_cost` is roughly linear in budget and crew size.
pub fn cost_records(rows: usize, seed: u64) -> Vec<Record> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..rows)
        .map(|_| {
            let budget: f64 = rng.random_range(10_000.0..100_000.0);
            let crew: f64 = rng.random_range(2.0..20.0);
            let region = REGIONS[rng.random_range(0..REGIONS.len())];
            let uplift = if region == "coast" { 5_000.0 } else { 0.0 };
            let noise: f64 = rng.random_range(-2_000.0..2_000.0);
            Record::new()
                .with("budget", budget)
                .with("crew", crew)
                .with("region", region)
                .with("final_cost", budget * 1.1 + crew * 800.0 + uplift + noise)
        })
        .collect()
}

/// Same shape as [`cost_records`] with a constant target.
pub fn flat_cost_records(rows: usize, seed: u64) -> Vec<Record> {
    cost_records(rows, seed)
        .into_iter()
        .map(|mut r| {
            r.insert("final_cost", 1_000.0);
            r
        })
        .collect()
}

/// Same inputs as [`cost_records`], targets drawn independently of them.
pub fn noisy_cost_records(rows: usize, seed: u64) -> Vec<Record> {
    let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
    cost_records(rows, seed)
        .into_iter()
        .map(|mut r| {
            r.insert("final_cost", rng.random_range(1_000.0..100_000.0));
            r
        })
        .collect()
}

pub fn cost_spec(name: &str, algorithm: &str, threshold: PromotionThreshold) -> DefinitionSpec {
    DefinitionSpec::new(
        name,
        TaskType::new("cost"),
        ProblemKind::Regression,
        vec![
            FeatureRule::new("budget", RuleKind::Standardize),
            FeatureRule::new("crew", RuleKind::Standardize),
            FeatureRule::new("region", RuleKind::OneHot),
        ],
        "final_cost",
        algorithm,
        threshold,
    )
}

pub fn always_pass() -> PromotionThreshold {
    PromotionThreshold::at_least(MetricName::Accuracy, 0.0)
}

pub fn never_pass() -> PromotionThreshold {
    PromotionThreshold::at_least(MetricName::Accuracy, 1.01)
}

pub fn input(budget: f64, crew: f64, region: &str) -> Record {
    Record::new()
        .with("budget", budget)
        .with("crew", crew)
        .with("region", region)
}

pub fn memory_source(name: &str, records: Vec<Record>) -> Arc<MemoryDataSource> {
    let source = Arc::new(MemoryDataSource::new());
    source.put(name, records);
    source
}

pub fn wait_for_job(engine: &Engine, job: JobId) -> TrainingJob {
    let deadline = Instant::now() + WAIT;
    loop {
        let current = engine.poll_training(job).unwrap();
        if current.status.is_terminal() || Instant::now() > deadline {
            return current;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Wait until the version has left `training`, i.e. every retry has played out.
pub fn wait_for_version(engine: &Engine, version: VersionId) -> VersionStatus {
    let deadline = Instant::now() + WAIT;
    loop {
        let status = engine.get_version(version).unwrap().status;
        if status != VersionStatus::Training || Instant::now() > deadline {
            return status;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Train `definition` to completion and return the resulting version.
pub fn train(engine: &Engine, definition: forecast_core::DefinitionId) -> forecast_core::ModelVersion {
    let job = engine.submit_training(definition, Hyperparameters::new()).unwrap();
    wait_for_version(engine, job.version_id);
    engine.get_version(job.version_id).unwrap()
}

/// Fails its first `failures` snapshots with a storage error, then delegates.
pub struct FlakySource {
    inner: Arc<MemoryDataSource>,
    failures: AtomicUsize,
    pub calls: AtomicUsize,
}

impl FlakySource {
    pub fn new(inner: Arc<MemoryDataSource>, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }
}

impl DataSource for FlakySource {
    fn snapshot(&self, definition_name: &str) -> EngineResult<Vec<Record>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(EngineError::Storage("warehouse connection reset".into()));
        }
        self.inner.snapshot(definition_name)
    }
}

/// Checks the cancellation flag every 10ms for up to `max_ms`, then predicts 0.
pub struct SlowAlgorithm {
    pub max_ms: u64,
}

impl Algorithm for SlowAlgorithm {
    fn id(&self) -> &str {
        "slow"
    }

    fn fit(
        &self,
        _features: &FeatureMatrix,
        _target: &[f64],
        _params: &Hyperparameters,
        control: &TrainingControl,
    ) -> EngineResult<Vec<u8>> {
        let started = Instant::now();
        while started.elapsed() < Duration::from_millis(self.max_ms) {
            control.checkpoint()?;
            thread::sleep(Duration::from_millis(10));
        }
        Ok(Vec::new())
    }

    fn load(&self, _artifact: &[u8]) -> EngineResult<Arc<dyn Predictor>> {
        Ok(Arc::new(Constant(0.0)))
    }
}

struct Constant(f64);

impl Predictor for Constant {
    fn predict(&self, _row: &[f64]) -> EngineResult<Inference> {
        Ok(Inference {
            value: self.0,
            confidence: 0.0,
        })
    }
}

/// Panics inside `fit`, the way a buggy third-party algorithm would.
pub struct PanickingAlgorithm;

impl Algorithm for PanickingAlgorithm {
    fn id(&self) -> &str {
        "panicking"
    }

    fn fit(
        &self,
        _features: &FeatureMatrix,
        _target: &[f64],
        _params: &Hyperparameters,
        _control: &TrainingControl,
    ) -> EngineResult<Vec<u8>> {
        panic!("solver exploded");
    }

    fn load(&self, _artifact: &[u8]) -> EngineResult<Arc<dyn Predictor>> {
        Ok(Arc::new(Constant(0.0)))
    }
}

/// Constant predictor that counts artifact loads and inferences, and can be slowed
/// down after training.
#[derive(Default)]
pub struct CountingAlgorithm {
    pub loads: AtomicUsize,
    pub inferences: Arc<AtomicUsize>,
    pub delay_ms: Arc<AtomicU64>,
}

struct CountingModel {
    inferences: Arc<AtomicUsize>,
    delay_ms: Arc<AtomicU64>,
}

impl Predictor for CountingModel {
    fn predict(&self, _row: &[f64]) -> EngineResult<Inference> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        self.inferences.fetch_add(1, Ordering::SeqCst);
        Ok(Inference {
            value: 42.0,
            confidence: 0.75,
        })
    }
}

impl Algorithm for CountingAlgorithm {
    fn id(&self) -> &str {
        "counting"
    }

    fn fit(
        &self,
        _features: &FeatureMatrix,
        _target: &[f64],
        _params: &Hyperparameters,
        _control: &TrainingControl,
    ) -> EngineResult<Vec<u8>> {
        Ok(vec![1])
    }

    fn load(&self, _artifact: &[u8]) -> EngineResult<Arc<dyn Predictor>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(CountingModel {
            inferences: self.inferences.clone(),
            delay_ms: self.delay_ms.clone(),
        }))
    }
}

/// Memory repository whose multi-row version writes (promotions) fail while armed.
#[derive(Default)]
pub struct UnpromotableRepo {
    inner: MemoryRepo,
    pub fail_promotions: AtomicBool,
}

impl RegistryRepo for UnpromotableRepo {
    fn put_definition(&self, definition: &ModelDefinition) -> EngineResult<()> {
        self.inner.put_definition(definition)
    }

    fn put_version(&self, version: &ModelVersion) -> EngineResult<()> {
        self.inner.put_version(version)
    }

    fn put_versions(&self, versions: &[ModelVersion]) -> EngineResult<()> {
        if self.fail_promotions.load(Ordering::SeqCst) {
            return Err(EngineError::Storage("registry volume is read-only".into()));
        }
        self.inner.put_versions(versions)
    }

    fn put_job(&self, job: &TrainingJob) -> EngineResult<()> {
        self.inner.put_job(job)
    }

    fn put_feature_set(&self, feature_set: &StoredFeatureSet) -> EngineResult<()> {
        self.inner.put_feature_set(feature_set)
    }

    fn put_prediction(&self, record: &PredictionRecord) -> EngineResult<()> {
        self.inner.put_prediction(record)
    }

    fn remove_prediction(&self, id: PredictionId) -> EngineResult<()> {
        self.inner.remove_prediction(id)
    }

    fn load(&self) -> EngineResult<RepoSnapshot> {
        self.inner.load()
    }
}
