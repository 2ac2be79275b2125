//! Wall-clock and elapsed-time helpers.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Current time as **milliseconds** since Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Milliseconds elapsed since `start`, as a float for latency sums.
#[inline]
pub fn elapsed_ms(start: Instant) -> f64 {
    duration_ms(start.elapsed())
}

/// A duration in fractional milliseconds.
#[inline]
pub fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
