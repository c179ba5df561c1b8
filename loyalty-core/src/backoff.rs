// Backoff Policy - Exponential backoff with jitter and an elapsed-time budget
//
// Pure: every delay is computed from (attempt, elapsed, retry-after hint,
// jitter sample). Callers own the clock and the sleeping.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    /// Total time budget; `0` means unbounded
    pub max_elapsed_ms: u64,
    /// Delay is spread uniformly over `base * (1 ± randomization_factor)`
    pub randomization_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            multiplier: 1.5,
            max_interval_ms: 60_000,
            max_elapsed_ms: 10_000,
            randomization_factor: 0.5,
        }
    }
}

impl BackoffPolicy {
    /// Policy used for the worker pool's outer re-enqueue delay
    pub fn requeue_default() -> Self {
        Self {
            initial_interval_ms: 5_000,
            multiplier: 2.0,
            max_interval_ms: 300_000,
            max_elapsed_ms: 0,
            randomization_factor: 0.2,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_interval_ms == 0 {
            return Err(Error::Config("backoff initial interval must be positive".to_string()));
        }
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(Error::Config("backoff multiplier must be >= 1".to_string()));
        }
        if self.max_interval_ms < self.initial_interval_ms {
            return Err(Error::Config(
                "backoff max interval must be >= initial interval".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.randomization_factor) {
            return Err(Error::Config(
                "backoff randomization factor must be in [0, 1)".to_string(),
            ));
        }
        Ok(())
    }

    /// Elapsed-time budget, `None` when unbounded
    pub fn max_elapsed(&self) -> Option<Duration> {
        (self.max_elapsed_ms > 0).then(|| Duration::from_millis(self.max_elapsed_ms))
    }

    /// Un-jittered delay before retry number `attempt` (0-based), capped at max interval
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay = self.initial_interval_ms as f64 * self.multiplier.powi(exponent);
        let capped = delay.min(self.max_interval_ms as f64);

        Duration::from_millis(capped as u64)
    }

    /// Spread `base` by the randomization factor. `sample` is uniform in `[0, 1)`.
    pub fn jittered(&self, base: Duration, sample: f64) -> Duration {
        let base_ms = base.as_millis() as f64;
        let spread = base_ms * self.randomization_factor;
        let offset = (sample.clamp(0.0, 1.0) * 2.0 - 1.0) * spread;

        Duration::from_millis((base_ms + offset).max(0.0) as u64)
    }

    /// Delay before the next attempt, or `None` when sleeping it would leave no
    /// time for that attempt inside the budget.
    ///
    /// A `retry_after` hint from the server is a lower bound on the delay.
    pub fn next_delay(
        &self,
        attempt: u32,
        elapsed: Duration,
        retry_after: Option<Duration>,
        sample: f64,
    ) -> Option<Duration> {
        let mut delay = self.jittered(self.base_delay(attempt), sample);
        if let Some(hint) = retry_after {
            delay = delay.max(hint);
        }

        match self.max_elapsed() {
            Some(budget) if elapsed + delay >= budget => None,
            _ => Some(delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy {
            initial_interval_ms: 1000,
            multiplier: 2.0,
            max_interval_ms: 10_000,
            max_elapsed_ms: 0,
            randomization_factor: 0.0,
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = no_jitter();

        assert_eq!(policy.base_delay(0).as_millis(), 1000);
        assert_eq!(policy.base_delay(1).as_millis(), 2000);
        assert_eq!(policy.base_delay(2).as_millis(), 4000);
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = no_jitter();

        assert_eq!(policy.base_delay(10).as_millis(), 10_000);
        assert_eq!(policy.base_delay(u32::MAX).as_millis(), 10_000);
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = BackoffPolicy {
            randomization_factor: 0.5,
            ..no_jitter()
        };
        let base = Duration::from_millis(1000);

        assert_eq!(policy.jittered(base, 0.0).as_millis(), 500);
        assert_eq!(policy.jittered(base, 0.5).as_millis(), 1000);
        assert_eq!(policy.jittered(base, 1.0).as_millis(), 1500);
    }

    #[test]
    fn test_retry_after_is_a_floor() {
        let policy = no_jitter();

        let delay = policy.next_delay(0, Duration::ZERO, Some(Duration::from_secs(7)), 0.5);
        assert_eq!(delay, Some(Duration::from_secs(7)));

        let delay = policy.next_delay(3, Duration::ZERO, Some(Duration::from_millis(10)), 0.5);
        assert_eq!(delay, Some(Duration::from_millis(8000)));
    }

    #[test]
    fn test_budget_exhaustion() {
        let policy = BackoffPolicy {
            max_elapsed_ms: 5_000,
            ..no_jitter()
        };

        assert_eq!(
            policy.next_delay(0, Duration::ZERO, None, 0.5),
            Some(Duration::from_millis(1000))
        );
        assert_eq!(
            policy.next_delay(1, Duration::from_millis(2_999), None, 0.5),
            Some(Duration::from_millis(2000))
        );
        assert_eq!(policy.next_delay(1, Duration::from_millis(3_000), None, 0.5), None);
        // A long Retry-After can exhaust the budget on its own
        assert_eq!(
            policy.next_delay(0, Duration::ZERO, Some(Duration::from_secs(6)), 0.5),
            None
        );
    }

    #[test]
    fn test_unbounded_policy_never_exhausts() {
        let policy = BackoffPolicy::requeue_default();
        assert!(policy.max_elapsed().is_none());
        assert!(policy
            .next_delay(50, Duration::from_secs(86_400), None, 0.5)
            .is_some());
    }

    #[test]
    fn test_defaults_validate() {
        BackoffPolicy::default().validate().unwrap();
        BackoffPolicy::requeue_default().validate().unwrap();

        let bad = BackoffPolicy {
            multiplier: 0.5,
            ..BackoffPolicy::default()
        };
        assert!(matches!(bad.validate(), Err(Error::Config(_))));
    }
}
