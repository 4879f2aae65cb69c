//! Exponential backoff with jitter and cap.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry delay policy: capped exponential growth plus uniform jitter.
///
/// For a zero-based attempt `n`:
///
/// ```text
/// exponential = min(max_backoff, base_backoff * 2^n)
/// jitter      = uniform(0, exponential * jitter_factor)
/// delay       = floor(exponential + jitter)   // millisecond resolution
/// ```
///
/// The delay feeds the failed event's `visible_at`, so a heavily retried
/// event does not get re-claimed the instant it lands back in the table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Fraction of the exponential delay added as random jitter, in
    /// `[0.0, 1.0]`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before re-admitting an event after failed attempt `attempt`
    /// (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self.exponential(attempt);
        let jitter_cap = exponential.as_millis() as f64 * self.jitter_factor;
        let jitter = if jitter_cap > 0.0 { fastrand::f64() * jitter_cap } else { 0.0 };
        Duration::from_millis(exponential.as_millis() as u64 + jitter as u64)
    }

    /// The deterministic component of [`RetryPolicy::delay`].
    fn exponential(&self, attempt: u32) -> Duration {
        let factor = 2u128.saturating_pow(attempt.min(32));
        let millis = (self.base_backoff.as_millis()).saturating_mul(factor);
        let capped = millis.min(self.max_backoff.as_millis());
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() }
    }

    #[test]
    fn doubles_per_attempt_until_cap() {
        let policy = no_jitter();
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(8), Duration::from_millis(25_600));
        assert_eq!(policy.delay(9), Duration::from_secs(30));
        assert_eq!(policy.delay(40), Duration::from_secs(30));
    }

    #[test]
    fn huge_attempt_counts_saturate_instead_of_overflowing() {
        let policy = no_jitter();
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_factor() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let delay = policy.delay(3); // exponential = 800ms
            assert!(delay >= Duration::from_millis(800));
            assert!(delay <= Duration::from_millis(880));
        }
    }

    #[test]
    fn zero_base_never_panics() {
        let policy = RetryPolicy {
            base_backoff: Duration::ZERO,
            max_backoff: Duration::from_secs(1),
            jitter_factor: 0.5,
        };
        assert_eq!(policy.delay(10), Duration::ZERO);
    }
}
