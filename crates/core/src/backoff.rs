//! Exponential backoff shared by job retries and observer reconnects.
//!
//! The delay starts at [`BackoffPolicy::initial_delay`], grows by
//! [`BackoffPolicy::multiplier`] after every failure, and is clamped to
//! [`BackoffPolicy::max_delay`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Doubling policy with the given base and cap.
    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// Calculate the next backoff delay from the current one.
    ///
    /// The result is clamped to `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms).min(self.max_delay)
    }

    /// Delay to wait after the `failed_attempt`-th failure (1-based).
    ///
    /// `delay_for_attempt(1) == initial_delay`, then grows geometrically
    /// up to `max_delay`. The sequence is non-decreasing.
    pub fn delay_for_attempt(&self, failed_attempt: u32) -> Duration {
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..failed_attempt.max(1) {
            if delay >= self.max_delay {
                break;
            }
            delay = self.next_delay(delay);
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_delay_doubles() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_delay(Duration::from_secs(1)), Duration::from_secs(2));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let policy = BackoffPolicy {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(policy.next_delay(Duration::from_secs(8)), Duration::from_secs(10));
    }

    #[test]
    fn custom_multiplier() {
        let policy = BackoffPolicy {
            multiplier: 3.0,
            max_delay: Duration::from_secs(60),
            ..Default::default()
        };
        assert_eq!(policy.next_delay(Duration::from_secs(2)), Duration::from_secs(6));
    }

    #[test]
    fn full_backoff_sequence() {
        let policy = BackoffPolicy::default();
        let mut delay = policy.initial_delay;
        let expected = [1, 2, 4, 8, 16, 30, 30, 30];

        for &expected_secs in &expected {
            assert_eq!(delay.as_secs(), expected_secs);
            delay = policy.next_delay(delay);
        }
    }

    #[test]
    fn delay_for_attempt_matches_sequence() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(5), Duration::from_secs(60));
        let delays: Vec<u64> = (1..=6).map(|a| policy.delay_for_attempt(a).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn delay_for_attempt_is_non_decreasing() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(250), Duration::from_secs(7));
        let mut previous = Duration::ZERO;
        for attempt in 1..=20 {
            let d = policy.delay_for_attempt(attempt);
            assert!(d >= previous, "attempt {attempt}: {d:?} < {previous:?}");
            previous = d;
        }
    }
}
