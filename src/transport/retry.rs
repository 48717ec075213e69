//! Retry policy for dialing a socket that may not be listening yet.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of connect attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 200;

/// Default delay before the second attempt.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(20);

/// Default upper bound on the delay between attempts.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Exponential backoff policy used by `SocketChannel::connect_with_retry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    #[serde(with = "crate::config::duration_ms")]
    pub initial_backoff: Duration,
    /// Cap on the delay between attempts.
    #[serde(with = "crate::config::duration_ms")]
    pub max_backoff: Duration,
    /// Factor applied to the delay after each failure.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: 1.5,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Fixed delay between a bounded number of attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff: delay,
            max_backoff: delay,
            multiplier: 1.0,
        }
    }

    /// Attempts actually made by this policy.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to sleep after failed attempt number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let nanos = (self.initial_backoff.as_nanos() as f64 * factor).round();
        if nanos >= self.max_backoff.as_nanos() as f64 {
            return self.max_backoff;
        }
        Duration::from_nanos(nanos as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts(), DEFAULT_MAX_ATTEMPTS);
        assert_eq!(policy.backoff(0), DEFAULT_INITIAL_BACKOFF);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(35),
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(10));
        assert_eq!(policy.backoff(1), Duration::from_millis(20));
        assert_eq!(policy.backoff(2), Duration::from_millis(35));
        assert_eq!(policy.backoff(50), Duration::from_millis(35));
    }

    #[test]
    fn test_fixed_and_no_retry() {
        let fixed = RetryPolicy::fixed(5, Duration::from_millis(7));
        assert_eq!(fixed.backoff(3), Duration::from_millis(7));
        assert_eq!(RetryPolicy::no_retry().attempts(), 1);

        let zero = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(zero.attempts(), 1);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts": 3, "initial_backoff": 5}"#).unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(5));
        assert_eq!(policy.max_backoff, DEFAULT_MAX_BACKOFF);
    }
}
