//! Backoff calculation shared by the transports and the dispatcher.
//!
//! Portable sync-only math; the async waiting happens at the call sites.

use std::time::Duration;

/// Multiplicative backoff: `min(cap, base * factor^attempt)`.
///
/// `attempt` is zero-based. Used by the message transport
/// (0.5 s × 1.5 ≤ 10 s) and the dispatcher submit retry
/// (0.05 s × 2 ≤ 0.2 s).
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
pub fn backoff_delay(attempt: u32, base: Duration, factor: f64, cap: Duration) -> Duration {
    let base_ms = base.as_millis() as f64;
    let cap_ms = cap.as_millis() as f64;
    let delay_ms = (base_ms * factor.powi(attempt.min(64) as i32)).min(cap_ms);
    Duration::from_millis(delay_ms.round().max(0.0) as u64)
}

/// Linear backoff: `min(cap, step * attempt)`.
///
/// `attempt` is one-based; attempt 0 yields zero delay. Used by sign-in
/// (2 s × n capped at 30 s).
#[must_use]
pub fn linear_backoff(attempt: u32, step: Duration, cap: Duration) -> Duration {
    step.saturating_mul(attempt).min(cap)
}

/// Advance a running backoff value by one step: `min(cap, current * factor)`.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn widen(current: Duration, factor: f64, cap: Duration) -> Duration {
    let next_ms = (current.as_millis() as f64 * factor).min(cap.as_millis() as f64);
    Duration::from_millis(next_ms.round().max(0.0) as u64)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_by_factor() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(10);
        assert_eq!(backoff_delay(0, base, 1.5, cap), Duration::from_millis(500));
        assert_eq!(backoff_delay(1, base, 1.5, cap), Duration::from_millis(750));
        assert_eq!(
            backoff_delay(2, base, 1.5, cap),
            Duration::from_millis(1125)
        );
    }

    #[test]
    fn backoff_caps() {
        let delay = backoff_delay(50, Duration::from_millis(500), 1.5, Duration::from_secs(10));
        assert_eq!(delay, Duration::from_secs(10));
    }

    #[test]
    fn dispatcher_retry_schedule() {
        let base = Duration::from_millis(50);
        let cap = Duration::from_millis(200);
        assert_eq!(backoff_delay(0, base, 2.0, cap), Duration::from_millis(50));
        assert_eq!(backoff_delay(1, base, 2.0, cap), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, base, 2.0, cap), Duration::from_millis(200));
    }

    #[test]
    fn linear_backoff_schedule() {
        let step = Duration::from_secs(2);
        let cap = Duration::from_secs(30);
        assert_eq!(linear_backoff(0, step, cap), Duration::ZERO);
        assert_eq!(linear_backoff(1, step, cap), Duration::from_secs(2));
        assert_eq!(linear_backoff(5, step, cap), Duration::from_secs(10));
        assert_eq!(linear_backoff(100, step, cap), Duration::from_secs(30));
    }

    #[test]
    fn widen_caps() {
        let cap = Duration::from_secs(10);
        let widened = widen(Duration::from_secs(8), 2.0, cap);
        assert_eq!(widened, cap);
    }

    #[test]
    fn widen_steps() {
        let next = widen(Duration::from_millis(500), 1.5, Duration::from_secs(10));
        assert_eq!(next, Duration::from_millis(750));
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let delay = backoff_delay(
            u32::MAX,
            Duration::from_millis(500),
            1.5,
            Duration::from_secs(10),
        );
        assert_eq!(delay, Duration::from_secs(10));
    }
}
