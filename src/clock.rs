//! Monotonic millisecond clock used for TTL arithmetic.
//!
//! Backed by [`Instant`] rather than [`std::time::SystemTime`] so that TTL
//! expiry is never affected by a wall-clock jump (NTP step, DST, operator
//! setting the clock back).

use once_cell::sync::Lazy;
use std::time::Instant;

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Current monotonic time in milliseconds since an arbitrary, fixed,
/// process-lifetime epoch.
pub fn now_ms() -> i64 {
	Instant::now().duration_since(*START).as_millis() as i64
}
