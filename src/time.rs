//! Timestamp generation utilities.
//!
//! Every payload carries two clocks: a steady (monotonic) clock for
//! interval arithmetic and a wall clock for correlation across hosts.
//! Both are 64-bit nanosecond counts.

use std::sync::OnceLock;
use std::time::Instant;

use chrono::Utc;

static MONOTONIC_ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds of steady-clock time since the first call in this
/// process. Never goes backwards; unrelated to the wall clock.
pub fn monotonic_ns() -> u64 {
    MONOTONIC_ANCHOR
        .get_or_init(Instant::now)
        .elapsed()
        .as_nanos() as u64
}

/// Wall-clock nanoseconds since the Unix epoch, UTC.
pub fn wall_clock_ns() -> u64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64
}
