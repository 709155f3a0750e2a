//! Runtime configuration: defaults, then an optional JSON file, then environment overrides.

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{EngineError, EngineResult};

/// Snapshot of configuration values consumed by the engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_root: String,
    pub training: TrainingCfg,
    pub serving: ServingCfg,
    pub monitoring: MonitoringCfg,
    pub log: LogCfg,
    pub sample_data: SampleDataMode,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingCfg {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Total attempts per version, including the first.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_duration_secs: u64,
    pub min_training_rows: usize,
    pub holdout_fraction: f64,
    pub split_seed: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingCfg {
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringCfg {
    /// Prediction records retained per definition before the oldest are evicted.
    pub retention: usize,
    pub drift_min_samples: usize,
    /// Most recent outcomes of the active version that drift is judged on.
    pub drift_window: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogCfg {
    pub level: String,
    pub json: bool,
}

/// What to do when a data snapshot is too small to train on.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum SampleDataMode {
    /// Fail the job with `InsufficientRows`.
    #[default]
    Disabled,
    /// Bootstrap synthetic rows from the snapshot up to `target_rows`. Logged loudly.
    Synthetic { target_rows: usize, seed: u64 },
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_root: "./data".to_string(),
            training: TrainingCfg::default(),
            serving: ServingCfg::default(),
            monitoring: MonitoringCfg::default(),
            log: LogCfg::default(),
            sample_data: SampleDataMode::Disabled,
        }
    }
}

impl Default for TrainingCfg {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            max_duration_secs: 30 * 60,
            min_training_rows: 20,
            holdout_fraction: 0.2,
            split_seed: 42,
        }
    }
}

impl Default for ServingCfg {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            cache_capacity: 1024,
        }
    }
}

impl Default for MonitoringCfg {
    fn default() -> Self {
        Self {
            retention: 10_000,
            drift_min_samples: 20,
            drift_window: 200,
        }
    }
}

impl Default for LogCfg {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl TrainingCfg {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    /// Exponential backoff before attempt `attempt + 1`, capped at `backoff_max_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

impl ServingCfg {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl EngineConfig {
    /// Defaults, overlaid by `FORECAST_CONFIG` (a JSON file) and `FORECAST_*` variables.
    pub fn load() -> EngineResult<Self> {
        let mut cfg = match env::var("FORECAST_CONFIG") {
            Ok(path) => Self::from_json_file(path)?,
            Err(_) => Self::default(),
        };
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a JSON config file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))
    }

    fn apply_env(&mut self) -> EngineResult<()> {
        if let Ok(root) = env::var("FORECAST_DATA_ROOT") {
            self.data_root = root;
        }
        if let Some(v) = env_parse("FORECAST_WORKERS")? {
            self.training.workers = v;
        }
        if let Some(v) = env_parse("FORECAST_QUEUE_CAPACITY")? {
            self.training.queue_capacity = v;
        }
        if let Some(v) = env_parse("FORECAST_MAX_ATTEMPTS")? {
            self.training.max_attempts = v;
        }
        if let Some(v) = env_parse("FORECAST_CACHE_TTL_SECS")? {
            self.serving.cache_ttl_secs = v;
        }
        if let Ok(level) = env::var("FORECAST_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(v) = env_parse("FORECAST_LOG_JSON")? {
            self.log.json = v;
        }
        if let Some(rows) = env_parse::<usize>("FORECAST_SAMPLE_DATA_ROWS")? {
            self.sample_data = if rows == 0 {
                SampleDataMode::Disabled
            } else {
                SampleDataMode::Synthetic {
                    target_rows: rows,
                    seed: self.training.split_seed,
                }
            };
        }
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> EngineResult<()> {
        let t = &self.training;
        if t.workers == 0 {
            return Err(EngineError::Config("training.workers must be > 0".into()));
        }
        if t.queue_capacity == 0 {
            return Err(EngineError::Config("training.queue_capacity must be > 0".into()));
        }
        if t.max_attempts == 0 {
            return Err(EngineError::Config("training.max_attempts must be > 0".into()));
        }
        if !(t.holdout_fraction > 0.0 && t.holdout_fraction < 1.0) {
            return Err(EngineError::Config(
                "training.holdout_fraction must be in (0, 1)".into(),
            ));
        }
        if self.serving.cache_capacity == 0 {
            return Err(EngineError::Config("serving.cache_capacity must be > 0".into()));
        }
        if self.monitoring.drift_window < self.monitoring.drift_min_samples.max(1) {
            return Err(EngineError::Config(
                "monitoring.drift_window must be >= drift_min_samples".into(),
            ));
        }
        if self.monitoring.retention == 0 {
            return Err(EngineError::Config("monitoring.retention must be > 0".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> EngineResult<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| EngineError::Config(format!("{key}: cannot parse `{raw}`"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = TrainingCfg {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            ..TrainingCfg::default()
        };
        assert_eq!(cfg.backoff(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff(2), Duration::from_millis(200));
        assert_eq!(cfg.backoff(3), Duration::from_millis(400));
        assert_eq!(cfg.backoff(10), Duration::from_millis(1_000));
    }

    #[test]
    fn rejects_zero_workers() {
        let mut cfg = EngineConfig::default();
        cfg.training.workers = 0;
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(
            &path,
            r#"{"training":{"workers":2},"sample_data":{"mode":"synthetic","target_rows":100,"seed":7}}"#,
        )
        .unwrap();
        let cfg = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.training.workers, 2);
        assert_eq!(cfg.training.queue_capacity, 64);
        assert_eq!(
            cfg.sample_data,
            SampleDataMode::Synthetic {
                target_rows: 100,
                seed: 7
            }
        );
    }
}
