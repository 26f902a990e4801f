//! Microsecond UTC timestamps.
//!
//! All persistent timestamps in the kernel are microseconds since the Unix
//! epoch, stored as `i64`. Microsecond timestamps fit in i64 until the year
//! 294 thousand.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as microseconds since the Unix epoch.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}
