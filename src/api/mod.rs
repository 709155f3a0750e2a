//! Entry point for hosting layers (HTTP handlers, CLIs, schedulers).

pub mod engine;

pub use engine::{Engine, API_VERSION};
