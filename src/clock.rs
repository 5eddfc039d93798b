use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch, as a float. Every background timer and the
/// seen-cache/hello-liveness checks are stamped against this one clock, so
/// components that started at slightly different instants still agree on
/// what "now" means.
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
