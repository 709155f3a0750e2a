//! Pluggable algorithm families behind one capability interface.
//!
//! Artifacts are opaque bytes to everyone but the algorithm that produced them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::common::error::{EngineError, EngineResult};
use crate::common::ids::JobId;
use crate::data::domain::FeatureMatrix;

use super::domain::Hyperparameters;

/// Output of a single inference.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Inference {
    pub value: f64,
    pub confidence: f64,
}

/// Cooperative cancellation and time budget, checked by algorithms between epochs.
#[derive(Clone, Debug)]
pub struct TrainingControl {
    job: JobId,
    cancelled: Arc<AtomicBool>,
    deadline: Option<(Instant, u64)>,
}

impl TrainingControl {
    pub fn new(job: JobId, cancelled: Arc<AtomicBool>, budget_ms: u64) -> Self {
        let deadline = Instant::now()
            .checked_add(std::time::Duration::from_millis(budget_ms))
            .map(|at| (at, budget_ms));
        Self {
            job,
            cancelled,
            deadline,
        }
    }

    /// No cancellation flag and no deadline.
    pub fn unbounded() -> Self {
        Self {
            job: JobId(0),
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    pub fn checkpoint(&self) -> EngineResult<()> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(EngineError::Cancelled(self.job.raw()));
        }
        if let Some((at, budget_ms)) = self.deadline {
            if Instant::now() >= at {
                return Err(EngineError::Timeout { budget_ms });
            }
        }
        Ok(())
    }
}

/// A decoded artifact, ready for repeated inference.
pub trait Predictor: Send + Sync {
    fn predict(&self, row: &[f64]) -> EngineResult<Inference>;
}

pub trait Algorithm: Send + Sync {
    fn id(&self) -> &str;

    fn fit(
        &self,
        features: &FeatureMatrix,
        target: &[f64],
        params: &Hyperparameters,
        control: &TrainingControl,
    ) -> EngineResult<Vec<u8>>;

    /// Decode `artifact` once. Callers keep the predictor for as long as the version serves.
    fn load(&self, artifact: &[u8]) -> EngineResult<Arc<dyn Predictor>>;

    /// Single-row inference that decodes the artifact on every call.
    fn infer(&self, artifact: &[u8], row: &[f64]) -> EngineResult<Inference> {
        self.load(artifact)?.predict(row)
    }
}

/// Algorithms known to the engine, keyed by identifier.
pub struct AlgorithmCatalog {
    algorithms: HashMap<String, Arc<dyn Algorithm>>,
}

impl AlgorithmCatalog {
    pub fn empty() -> Self {
        Self {
            algorithms: HashMap::new(),
        }
    }

    /// `linear_regression`, `logistic_regression` and `mean_baseline`.
    pub fn with_defaults() -> Self {
        let mut catalog = Self::empty();
        catalog.register(Arc::new(LinearRegression));
        catalog.register(Arc::new(LogisticRegression));
        catalog.register(Arc::new(MeanBaseline));
        catalog
    }

    pub fn register(&mut self, algorithm: Arc<dyn Algorithm>) {
        self.algorithms.insert(algorithm.id().to_string(), algorithm);
    }

    pub fn get(&self, id: &str) -> EngineResult<Arc<dyn Algorithm>> {
        self.algorithms
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("algorithm", id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.algorithms.contains_key(id)
    }
}

impl Default for AlgorithmCatalog {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn encode<T: Serialize>(model: &T) -> EngineResult<Vec<u8>> {
    bincode::serde::encode_to_vec(model, bincode::config::standard())
        .map_err(|e| EngineError::permanent(format!("artifact encode: {e}")))
}

fn decode<T: DeserializeOwned>(artifact: &[u8]) -> EngineResult<T> {
    bincode::serde::decode_from_slice(artifact, bincode::config::standard())
        .map(|(model, _)| model)
        .map_err(|e| EngineError::permanent(format!("artifact decode: {e}")))
}

fn check_shapes(features: &FeatureMatrix, target: &[f64]) -> EngineResult<()> {
    if features.is_empty() || features.len() != target.len() {
        return Err(EngineError::permanent(format!(
            "{} feature rows for {} targets",
            features.len(),
            target.len()
        )));
    }
    Ok(())
}

/// Per-column mean/std used to condition gradient descent; stored in the artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Scaler {
    means: Vec<f64>,
    stds: Vec<f64>,
}

impl Scaler {
    fn fit(features: &FeatureMatrix) -> Self {
        let n = features.len() as f64;
        let w = features.width();
        let mut means = vec![0.0; w];
        for row in features.rows() {
            for (m, x) in means.iter_mut().zip(row) {
                *m += x / n;
            }
        }
        let mut stds = vec![0.0; w];
        for row in features.rows() {
            for ((s, x), m) in stds.iter_mut().zip(row).zip(&means) {
                *s += (x - m).powi(2) / n;
            }
        }
        for s in stds.iter_mut() {
            *s = if s.sqrt() > 1e-12 { s.sqrt() } else { 1.0 };
        }
        Self { means, stds }
    }

    fn apply(&self, row: &[f64]) -> EngineResult<Vec<f64>> {
        if row.len() != self.means.len() {
            return Err(EngineError::permanent(format!(
                "artifact expects {} features, got {}",
                self.means.len(),
                row.len()
            )));
        }
        Ok(row
            .iter()
            .zip(self.means.iter().zip(&self.stds))
            .map(|(x, (m, s))| (x - m) / s)
            .collect())
    }
}

fn dot(w: &[f64], z: &[f64]) -> f64 {
    w.iter().zip(z).map(|(a, b)| a * b).sum()
}

/// Batch gradient descent over standardised inputs. `link` maps the linear score to a prediction.
fn gradient_descent(
    z: &[Vec<f64>],
    y: &[f64],
    params: &Hyperparameters,
    control: &TrainingControl,
    link: fn(f64) -> f64,
) -> EngineResult<(Vec<f64>, f64)> {
    let epochs = params.get_or("epochs", 300.0).max(1.0) as u32;
    let lr = params.get_or("learning_rate", 0.1);
    let l2 = params.get_or("l2", 0.0);
    if !(lr > 0.0 && lr.is_finite()) || l2 < 0.0 {
        return Err(EngineError::permanent("learning_rate must be > 0 and l2 >= 0"));
    }

    let n = y.len() as f64;
    let width = z.first().map(Vec::len).unwrap_or(0);
    let mut w = vec![0.0; width];
    let mut b = 0.0;
    let mut grad = vec![0.0; width];
    for _ in 0..epochs {
        control.checkpoint()?;
        grad.iter_mut().for_each(|g| *g = 0.0);
        let mut grad_b = 0.0;
        for (zi, yi) in z.iter().zip(y) {
            let err = link(b + dot(&w, zi)) - yi;
            for (g, x) in grad.iter_mut().zip(zi) {
                *g += err * x;
            }
            grad_b += err;
        }
        for (wj, g) in w.iter_mut().zip(&grad) {
            *wj -= lr * (g / n + l2 * *wj);
        }
        b -= lr * grad_b / n;
        if !b.is_finite() || w.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::permanent("gradient descent diverged"));
        }
    }
    Ok((w, b))
}

fn identity(x: f64) -> f64 {
    x
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Ridge-regularised least squares fitted by gradient descent.
///
/// Hyperparameters: `epochs` (300), `learning_rate` (0.1), `l2` (0.0).
pub struct LinearRegression;

#[derive(Serialize, Deserialize)]
struct LinearModel {
    scaler: Scaler,
    weights: Vec<f64>,
    bias: f64,
    y_mean: f64,
    y_std: f64,
    residual_rmse: f64,
}

impl LinearModel {
    fn value(&self, row: &[f64]) -> EngineResult<f64> {
        let z = self.scaler.apply(row)?;
        Ok((self.bias + dot(&self.weights, &z)) * self.y_std + self.y_mean)
    }
}

impl Predictor for LinearModel {
    fn predict(&self, row: &[f64]) -> EngineResult<Inference> {
        let value = self.value(row)?;
        let confidence = 1.0 / (1.0 + self.residual_rmse / value.abs().max(1e-9));
        Ok(Inference { value, confidence })
    }
}

impl Algorithm for LinearRegression {
    fn id(&self) -> &str {
        "linear_regression"
    }

    fn fit(
        &self,
        features: &FeatureMatrix,
        target: &[f64],
        params: &Hyperparameters,
        control: &TrainingControl,
    ) -> EngineResult<Vec<u8>> {
        check_shapes(features, target)?;
        let scaler = Scaler::fit(features);
        let z = features
            .rows()
            .map(|r| scaler.apply(r))
            .collect::<EngineResult<Vec<_>>>()?;
        let n = target.len() as f64;
        let y_mean = target.iter().sum::<f64>() / n;
        let y_std = {
            let s = (target.iter().map(|y| (y - y_mean).powi(2)).sum::<f64>() / n).sqrt();
            if s > 1e-12 { s } else { 1.0 }
        };
        let y: Vec<f64> = target.iter().map(|v| (v - y_mean) / y_std).collect();
        let (weights, bias) = gradient_descent(&z, &y, params, control, identity)?;

        let mut model = LinearModel {
            scaler,
            weights,
            bias,
            y_mean,
            y_std,
            residual_rmse: 0.0,
        };
        let mut sse = 0.0;
        for (row, actual) in features.rows().zip(target) {
            sse += (model.value(row)? - actual).powi(2);
        }
        model.residual_rmse = (sse / n).sqrt();
        encode(&model)
    }

    fn load(&self, artifact: &[u8]) -> EngineResult<Arc<dyn Predictor>> {
        Ok(Arc::new(decode::<LinearModel>(artifact)?))
    }
}

/// Binary logistic regression; targets must be 0 or 1. Predicts the class.
///
/// Hyperparameters: `epochs` (300), `learning_rate` (0.1), `l2` (0.0).
pub struct LogisticRegression;

#[derive(Serialize, Deserialize)]
struct LogisticModel {
    scaler: Scaler,
    weights: Vec<f64>,
    bias: f64,
}

impl Predictor for LogisticModel {
    fn predict(&self, row: &[f64]) -> EngineResult<Inference> {
        let z = self.scaler.apply(row)?;
        let p = sigmoid(self.bias + dot(&self.weights, &z));
        Ok(Inference {
            value: if p >= 0.5 { 1.0 } else { 0.0 },
            confidence: p.max(1.0 - p),
        })
    }
}

impl Algorithm for LogisticRegression {
    fn id(&self) -> &str {
        "logistic_regression"
    }

    fn fit(
        &self,
        features: &FeatureMatrix,
        target: &[f64],
        params: &Hyperparameters,
        control: &TrainingControl,
    ) -> EngineResult<Vec<u8>> {
        check_shapes(features, target)?;
        if let Some(bad) = target.iter().find(|y| **y != 0.0 && **y != 1.0) {
            return Err(EngineError::permanent(format!(
                "logistic_regression needs 0/1 targets, found {bad}"
            )));
        }
        let scaler = Scaler::fit(features);
        let z = features
            .rows()
            .map(|r| scaler.apply(r))
            .collect::<EngineResult<Vec<_>>>()?;
        let (weights, bias) = gradient_descent(&z, target, params, control, sigmoid)?;
        encode(&LogisticModel {
            scaler,
            weights,
            bias,
        })
    }

    fn load(&self, artifact: &[u8]) -> EngineResult<Arc<dyn Predictor>> {
        Ok(Arc::new(decode::<LogisticModel>(artifact)?))
    }
}

/// Predicts the training mean (for 0/1 targets this rounds to the majority class).
pub struct MeanBaseline;

#[derive(Serialize, Deserialize)]
struct MeanModel {
    mean: f64,
    std: f64,
}

impl Predictor for MeanModel {
    fn predict(&self, _row: &[f64]) -> EngineResult<Inference> {
        Ok(Inference {
            value: self.mean,
            confidence: 1.0 / (1.0 + self.std / self.mean.abs().max(1e-9)),
        })
    }
}

impl Algorithm for MeanBaseline {
    fn id(&self) -> &str {
        "mean_baseline"
    }

    fn fit(
        &self,
        features: &FeatureMatrix,
        target: &[f64],
        _params: &Hyperparameters,
        control: &TrainingControl,
    ) -> EngineResult<Vec<u8>> {
        check_shapes(features, target)?;
        control.checkpoint()?;
        let n = target.len() as f64;
        let mean = target.iter().sum::<f64>() / n;
        let std = (target.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n).sqrt();
        encode(&MeanModel { mean, std })
    }

    fn load(&self, artifact: &[u8]) -> EngineResult<Arc<dyn Predictor>> {
        Ok(Arc::new(decode::<MeanModel>(artifact)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: &[[f64; 2]]) -> FeatureMatrix {
        let mut m = FeatureMatrix::new(vec!["a".into(), "b".into()]);
        for r in rows {
            m.push_row(r);
        }
        m
    }

    #[test]
    fn linear_regression_recovers_a_plane() {
        let rows: Vec<[f64; 2]> = (0..50).map(|i| [i as f64, (i % 7) as f64 * 100.0]).collect();
        let target: Vec<f64> = rows.iter().map(|r| 3.0 * r[0] + 0.5 * r[1] + 1000.0).collect();
        let m = matrix(&rows);
        let alg = LinearRegression;
        let params = Hyperparameters::new().with("epochs", 2000.0);
        let artifact = alg.fit(&m, &target, &params, &TrainingControl::unbounded()).unwrap();
        let out = alg.infer(&artifact, &[10.0, 300.0]).unwrap();
        assert!((out.value - 1180.0).abs() < 1.0, "got {}", out.value);
        assert!(out.confidence > 0.9);
    }

    #[test]
    fn logistic_regression_separates_classes() {
        let rows: Vec<[f64; 2]> = (0..40).map(|i| [i as f64, 1.0]).collect();
        let target: Vec<f64> = (0..40).map(|i| if i >= 20 { 1.0 } else { 0.0 }).collect();
        let m = matrix(&rows);
        let alg = LogisticRegression;
        let params = Hyperparameters::new().with("epochs", 500.0).with("learning_rate", 0.5);
        let artifact = alg.fit(&m, &target, &params, &TrainingControl::unbounded()).unwrap();
        assert_eq!(alg.infer(&artifact, &[35.0, 1.0]).unwrap().value, 1.0);
        assert_eq!(alg.infer(&artifact, &[2.0, 1.0]).unwrap().value, 0.0);
    }

    #[test]
    fn logistic_regression_rejects_non_binary_targets() {
        let m = matrix(&[[1.0, 2.0], [2.0, 3.0]]);
        let err = LogisticRegression
            .fit(&m, &[0.0, 2.0], &Hyperparameters::new(), &TrainingControl::unbounded())
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn cancelled_control_stops_fit() {
        let flag = Arc::new(AtomicBool::new(true));
        let control = TrainingControl::new(JobId(9), flag, 60_000);
        let m = matrix(&[[1.0, 2.0], [2.0, 3.0]]);
        let err = LinearRegression
            .fit(&m, &[1.0, 2.0], &Hyperparameters::new(), &control)
            .unwrap_err();
        assert_eq!(err, EngineError::Cancelled(9));
    }

    #[test]
    fn expired_budget_times_out() {
        let control = TrainingControl::new(JobId(1), Arc::new(AtomicBool::new(false)), 0);
        assert_eq!(control.checkpoint(), Err(EngineError::Timeout { budget_ms: 0 }));
    }

    #[test]
    fn width_mismatch_is_reported() {
        let m = matrix(&[[1.0, 2.0], [2.0, 3.0], [3.0, 5.0]]);
        let artifact = LinearRegression
            .fit(&m, &[1.0, 2.0, 3.0], &Hyperparameters::new(), &TrainingControl::unbounded())
            .unwrap();
        assert!(LinearRegression.infer(&artifact, &[1.0]).is_err());
    }

    #[test]
    fn loaded_predictor_matches_one_off_inference() {
        let m = matrix(&[[1.0, 2.0], [2.0, 3.0], [3.0, 5.0], [4.0, 4.0]]);
        let target = [10.0, 20.0, 30.0, 40.0];
        let artifact = LinearRegression
            .fit(&m, &target, &Hyperparameters::new(), &TrainingControl::unbounded())
            .unwrap();
        let model = LinearRegression.load(&artifact).unwrap();
        for row in m.rows() {
            assert_eq!(model.predict(row).unwrap(), LinearRegression.infer(&artifact, row).unwrap());
        }
        assert!(LinearRegression.load(&[]).is_err());
    }

    #[test]
    fn catalog_lookup() {
        let catalog = AlgorithmCatalog::with_defaults();
        assert!(catalog.contains("mean_baseline"));
        assert!(matches!(
            catalog.get("xgboost"),
            Err(EngineError::NotFound { kind: "algorithm", .. })
        ));
    }
}
