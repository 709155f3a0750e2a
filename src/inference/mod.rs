//! Prediction serving: active-version resolution, caching and request coalescing.

pub mod cache;
pub mod domain;
pub mod service;

pub use cache::{PredictionCache, SingleFlight};
pub use domain::Prediction;
pub use service::PredictionService;
