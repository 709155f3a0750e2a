//! Logging bootstrap on top of `tracing`.
//!
//! Library code only emits `tracing` events; hosts (or tests) call [`init`] once
//! to install a subscriber. `RUST_LOG` wins over the configured level.

use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

use super::config::LogCfg;

/// Install the global subscriber. Returns `false` if one was already installed.
pub fn init(cfg: &LogCfg) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("forecast_core={},warn", cfg.level)));

    if cfg.json {
        let layer = fmt::layer()
            .json()
            .with_target(true)
            .with_thread_names(true);
        Registry::default().with(filter).with(layer).try_init().is_ok()
    } else {
        let layer = fmt::layer().with_target(true).with_thread_names(true);
        Registry::default().with(filter).with(layer).try_init().is_ok()
    }
}
