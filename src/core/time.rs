//! Wall-clock helpers.
//!
//! The train and the controller stamp packets with their own real-time
//! clocks, so everything latency-related works in milliseconds since the
//! Unix epoch. Handlers take `now_ms` as a parameter so tests can feed
//! synthetic clocks.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current controller wall clock in milliseconds since the Unix epoch.
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current controller wall clock in fractional seconds since the Unix epoch.
///
/// Keepalive bodies use this format to match the train-side firmware.
pub fn unix_time_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
