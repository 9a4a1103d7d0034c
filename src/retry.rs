//! Retry policy: decides backoff delays for failed attempts.

use std::time::Duration;

/// Exponential backoff with bounded jitter and a delay cap.
///
/// Pure: `compute_delay` has no side effects beyond drawing jitter, and the
/// sequence of delays is monotonically non-decreasing in the attempt number.
/// Jitter is additive-only and bounded by `jitter_ratio`, which is clamped to
/// `multiplier - 1` so a jittered delay for attempt n never exceeds the base
/// delay for attempt n + 1.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Backoff multiplier per attempt.
    pub multiplier: f64,
    /// Upper bound on any computed delay.
    pub max_delay: Duration,
    /// Fraction of the delay added as random jitter, in [0, multiplier - 1].
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            jitter_ratio: 0.5,
        }
    }
}

impl RetryPolicy {
    /// A policy with no jitter, useful when delays must be exact.
    pub fn fixed(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            jitter_ratio: 0.0,
        }
    }

    /// Delay to wait before re-enqueueing after the given attempt (1-indexed).
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let base_secs = self.base_delay.as_secs_f64();
        let raw = base_secs * self.multiplier.powi(exponent as i32);

        let jitter_ratio = self.jitter_ratio.clamp(0.0, (self.multiplier - 1.0).max(0.0));
        let jitter = if jitter_ratio > 0.0 {
            raw * jitter_ratio * rand::random::<f64>()
        } else {
            0.0
        };

        Duration::from_secs_f64((raw + jitter).min(self.max_delay.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_without_jitter_doubles() {
        let policy = RetryPolicy::fixed(Duration::from_secs(2), 2.0, Duration::from_secs(300));
        assert_eq!(policy.compute_delay(1), Duration::from_secs(2));
        assert_eq!(policy.compute_delay(2), Duration::from_secs(4));
        assert_eq!(policy.compute_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn delay_never_exceeds_max() {
        let policy = RetryPolicy::default();
        for attempt in 1..=100 {
            assert!(policy.compute_delay(attempt) <= policy.max_delay);
        }
    }

    #[test]
    fn jittered_delays_are_monotonic_non_decreasing() {
        let policy = RetryPolicy::default();
        let floor = RetryPolicy {
            jitter_ratio: 0.0,
            ..policy.clone()
        };
        // Jitter is bounded so the largest possible delay for attempt n never
        // exceeds the smallest possible delay for attempt n + 1. Sample
        // repeatedly to exercise the random component.
        for _ in 0..100 {
            for attempt in 1..=20 {
                let sampled = policy.compute_delay(attempt);
                assert!(sampled >= floor.compute_delay(attempt));
                assert!(sampled <= floor.compute_delay(attempt + 1));
                assert!(sampled <= policy.max_delay);
            }
        }
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.compute_delay(u32::MAX), policy.max_delay);
    }
}
