//! Reconnect backoff.
//!
//! Pure functions of (attempt, base, multiplier, cap) so the schedule can be
//! checked without timers.

use std::time::Duration;

/// Delay before reconnect attempt number `attempt` (zero based).
///
/// `base * multiplier^attempt`, rounded to whole milliseconds and capped at
/// `cap`.
pub fn reconnect_delay(attempt: u32, base: Duration, multiplier: f64, cap: Duration) -> Duration {
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let delay_ms = base.as_millis() as f64 * multiplier.powi(exponent);
    let cap_ms = cap.as_millis() as f64;

    if !delay_ms.is_finite() || delay_ms >= cap_ms {
        return cap;
    }
    Duration::from_millis(delay_ms.round() as u64)
}

/// Reconnect schedule derived from transport configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect.
    pub base: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Upper bound for any delay.
    pub cap: Duration,
}

impl BackoffPolicy {
    /// Delay for the given zero based attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        reconnect_delay(attempt, self.base, self.multiplier, self.cap)
    }
}
