//! Wall-clock helpers. Durations inside the engine use `Instant`; persisted
//! timestamps use milliseconds since the Unix epoch.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current timestamp in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
