//! Retry policy for retryable task failures.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff schedule for a task's retryable failures.
///
/// Attempt numbers are 1-based: attempt 1 is the initial try, attempt 2 the
/// first retry, and so on. The delay before attempt `n` (n > 1) is
/// `min(backoff_cap, backoff_base * 2^(n-2))`, jittered by `± jitter`.
///
/// ```
/// use gleitzeit_kernel::reliability::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1), 0.0);
/// assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(100));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one).
    pub max_attempts: u32,

    /// Base delay used in the exponential backoff formula.
    #[serde(with = "duration_millis")]
    pub backoff_base: Duration,

    /// Upper bound on any single backoff delay.
    #[serde(with = "duration_millis")]
    pub backoff_cap: Duration,

    /// Jitter fraction in `[0.0, 1.0]`; the delay is scaled by `(1 ± jitter)`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(60), 0.1)
    }
}

impl RetryPolicy {
    /// Build a policy from its four wire-format fields.
    pub fn new(max_attempts: u32, backoff_base: Duration, backoff_cap: Duration, jitter: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
            backoff_cap,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// A policy that never retries: one attempt, no backoff.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, 0.0)
    }

    /// Set the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the backoff base.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Set the backoff cap.
    pub fn with_backoff_cap(mut self, cap: Duration) -> Self {
        self.backoff_cap = cap;
        self
    }

    /// Set the jitter fraction, clamped to `[0.0, 1.0]`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait before the given attempt number (1-based). Attempt 1
    /// (the initial try) always returns zero.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 2;
        let base = self.backoff_base.as_secs_f64() * 2f64.powi(retry_num as i32);
        let capped = base.min(self.backoff_cap.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            capped + rng.gen_range(-jitter_range..=jitter_range)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Whether a further attempt is available after `current_attempt`.
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff_base, Duration::from_secs(1));
    }

    #[test]
    fn no_retry_has_one_attempt() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn delay_progression_without_jitter() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(10), 0.0);

        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(400));
    }

    #[test]
    fn delay_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(500), 0.0);
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(10), 0.2);
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(3).as_secs_f64();
            assert!(delay >= 0.2 * 0.8 && delay <= 0.2 * 1.2 + 1e-9);
        }
    }

    #[test]
    fn has_attempts_remaining_boundary() {
        let policy = RetryPolicy::new(3, Duration::ZERO, Duration::ZERO, 0.0);
        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }

    #[test]
    fn round_trips_through_json() {
        let policy = RetryPolicy::default().with_max_attempts(10);
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
