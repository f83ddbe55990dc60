//! Requeue policy for failed queue entries.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// What to do with an entry after its handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Put the entry back, due at the given time
    Requeue { due_at: DateTime<Utc> },
    /// Give up on the entry
    DeadLetter,
}

/// Exponential requeue backoff with a retry ceiling.
///
/// After the Nth consecutive failure the entry is due again at
/// `now + base_delay * 2^N`. Reaching `max_retries` dead-letters it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before the entry is due again after `retry_count` failures.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count);
        self.base_delay.saturating_mul(factor)
    }

    /// Decide the fate of an entry that has now failed `retry_count` times.
    pub fn decide(&self, retry_count: u32, permanent: bool, now: DateTime<Utc>) -> FailureDecision {
        if permanent || retry_count >= self.max_retries {
            return FailureDecision::DeadLetter;
        }
        let delay = TimeDelta::from_std(self.delay_for(retry_count)).unwrap_or(TimeDelta::MAX);
        FailureDecision::Requeue {
            due_at: now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nth_failure_is_due_after_two_to_the_n_minutes() {
        let policy = BackoffPolicy::default();
        let now = Utc::now();

        for n in 1..5 {
            let expected = now + TimeDelta::minutes(2i64.pow(n));
            assert_eq!(
                policy.decide(n, false, now),
                FailureDecision::Requeue { due_at: expected }
            );
        }
    }

    #[test]
    fn test_ceiling_and_permanent_dead_letter() {
        let policy = BackoffPolicy::default();
        let now = Utc::now();
        assert_eq!(policy.decide(5, false, now), FailureDecision::DeadLetter);
        assert_eq!(policy.decide(1, true, now), FailureDecision::DeadLetter);
    }

    #[test]
    fn test_delay_saturates() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(60));
        assert_eq!(
            policy.delay_for(64),
            Duration::from_secs(60).saturating_mul(u32::MAX)
        );
    }
}
