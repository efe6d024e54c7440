//! Exponential backoff calculator
//!
//! `delay = min(base * multiplier^attempt, BACKOFF_CAP)`. Attempt index 0 is the
//! delay before the second attempt; there is never a delay before the first.

use std::time::Duration;

/// Upper bound for any computed delay.
pub const BACKOFF_CAP: Duration = Duration::from_millis(30_000);

/// Delay to wait before the attempt following `attempt_index`.
///
/// Overflowing or non-finite intermediate values clamp to [`BACKOFF_CAP`].
pub fn next_delay(attempt_index: u32, base_delay: Duration, multiplier: f64) -> Duration {
    let cap_ms = BACKOFF_CAP.as_millis() as f64;
    let base_ms = base_delay.as_millis() as f64;
    let delay_ms = base_ms * multiplier.powf(f64::from(attempt_index));

    if !delay_ms.is_finite() || delay_ms >= cap_ms {
        return BACKOFF_CAP;
    }
    if delay_ms <= 0.0 {
        return Duration::ZERO;
    }

    Duration::from_millis(delay_ms.round() as u64)
}
