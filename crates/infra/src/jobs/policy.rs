//! Retry/backoff policy.
//!
//! Pure: no IO, and randomness is injectable so the policy can be tested with
//! a seeded rng.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use chorus_core::FailureKind;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempt ceiling; a transient failure on this attempt is terminal.
    pub max_attempts: u32,
    /// Base delay, doubled per attempt.
    pub base_delay: Duration,
    /// Maximum delay cap (jitter included).
    pub max_delay: Duration,
    /// Relative jitter; 0.2 draws the multiplier from U(0.8, 1.2).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
            jitter: 0.2,
        }
    }
}

/// Decision for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Back to PENDING, claimable again at the given instant.
    Retry(DateTime<Utc>),
    /// Terminal FAILED.
    Fail,
}

impl RetryPolicy {
    /// Deterministic component: `min(max_delay, base_delay * 2^attempt)`.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Jittered delay, never above `max_delay`.
    pub fn jittered_backoff<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_backoff(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let multiplier = if jitter > 0.0 {
            rng.gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        base.mul_f64(multiplier).min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` transient failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Decide what happens after attempt number `attempt` (1-based) failed.
    ///
    /// Uses the thread rng.
    pub fn next_schedule(
        &self,
        attempt: u32,
        kind: FailureKind,
        now: DateTime<Utc>,
    ) -> Schedule {
        self.next_schedule_with(attempt, kind, now, &mut rand::thread_rng())
    }

    pub fn next_schedule_with<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        kind: FailureKind,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Schedule {
        match kind {
            FailureKind::Permanent => Schedule::Fail,
            FailureKind::Transient if !self.should_retry(attempt) => Schedule::Fail,
            FailureKind::Transient => {
                let delay = self.jittered_backoff(attempt.saturating_sub(1), rng);
                Schedule::Retry(now + chrono::Duration::from_std(delay).unwrap_or_default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = policy();
        assert_eq!(policy.base_backoff(0), Duration::from_secs(30));
        assert_eq!(policy.base_backoff(1), Duration::from_secs(60));
        assert_eq!(policy.base_backoff(2), Duration::from_secs(120));
        assert_eq!(policy.base_backoff(4), Duration::from_secs(480));
        assert_eq!(policy.base_backoff(5), Duration::from_secs(600));
        assert_eq!(policy.base_backoff(40), Duration::from_secs(600));
    }

    #[test]
    fn permanent_failure_never_retries() {
        let now = Utc::now();
        assert_eq!(
            policy().next_schedule(1, FailureKind::Permanent, now),
            Schedule::Fail
        );
        assert_eq!(
            policy().next_schedule(0, FailureKind::Permanent, now),
            Schedule::Fail
        );
    }

    #[test]
    fn transient_failure_fails_at_ceiling() {
        let now = Utc::now();
        let policy = policy();
        assert!(matches!(
            policy.next_schedule(4, FailureKind::Transient, now),
            Schedule::Retry(_)
        ));
        assert_eq!(
            policy.next_schedule(5, FailureKind::Transient, now),
            Schedule::Fail
        );
        assert_eq!(
            policy.next_schedule(9, FailureKind::Transient, now),
            Schedule::Fail
        );
    }

    #[test]
    fn retry_lands_within_jitter_band() {
        let now = Utc::now();
        let mut rng = StdRng::seed_from_u64(7);
        let Schedule::Retry(at) =
            policy().next_schedule_with(1, FailureKind::Transient, now, &mut rng)
        else {
            panic!("expected retry");
        };
        let delay = (at - now).to_std().unwrap();
        assert!(delay >= Duration::from_secs(24), "{delay:?}");
        assert!(delay <= Duration::from_secs(36), "{delay:?}");

        let Schedule::Retry(at) =
            policy().next_schedule_with(3, FailureKind::Transient, now, &mut rng)
        else {
            panic!("expected retry");
        };
        let delay = (at - now).to_std().unwrap();
        assert!(delay >= Duration::from_secs(96), "{delay:?}");
        assert!(delay <= Duration::from_secs(144), "{delay:?}");
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..policy()
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            policy.jittered_backoff(2, &mut rng),
            Duration::from_secs(120)
        );
    }

    proptest! {
        #[test]
        fn base_backoff_is_monotonic_and_capped(attempt in 0u32..64) {
            let policy = policy();
            let here = policy.base_backoff(attempt);
            let next = policy.base_backoff(attempt + 1);
            prop_assert!(here <= next);
            prop_assert!(next <= policy.max_delay);
        }

        #[test]
        fn jittered_backoff_never_exceeds_cap(
            attempt in 0u32..64,
            seed in any::<u64>(),
            base_secs in 1u64..120,
            cap_secs in 120u64..3600,
        ) {
            let policy = RetryPolicy {
                base_delay: Duration::from_secs(base_secs),
                max_delay: Duration::from_secs(cap_secs),
                ..policy()
            };
            let mut rng = StdRng::seed_from_u64(seed);
            let delay = policy.jittered_backoff(attempt, &mut rng);
            prop_assert!(delay <= policy.max_delay);
            prop_assert!(delay >= policy.base_backoff(attempt).mul_f64(0.8));
        }
    }
}
