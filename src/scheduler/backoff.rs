//! Retry backoff computation.

use crate::core::RetryPolicy;
use rand::Rng;
use std::time::Duration;

/// Computes delays between retry attempts from a step's policy.
#[derive(Debug, Clone)]
pub struct Backoff {
    interval: Duration,
    exponential: bool,
    cap: Option<Duration>,
    jitter: bool,
}

impl Backoff {
    /// Builds the backoff schedule from a retry policy.
    #[must_use]
    pub fn from_policy(policy: &RetryPolicy) -> Self {
        Self {
            interval: policy.interval,
            exponential: policy.exponential,
            cap: policy.max_interval,
            jitter: policy.jitter,
        }
    }

    /// The delay after `attempt` (1-based) has failed.
    ///
    /// Constant policies always wait `interval`; exponential policies
    /// wait `interval * 2^(attempt-1)`, capped by `max_interval` when
    /// set. With jitter enabled the delay is drawn uniformly from
    /// `[0, delay]`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = if self.exponential {
            let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
            self.interval.saturating_mul(factor)
        } else {
            self.interval
        };

        let capped = match self.cap {
            Some(cap) => base.min(cap),
            None => base,
        };

        if self.jitter && !capped.is_zero() {
            let millis = capped.as_millis().min(u128::from(u64::MAX)) as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
        } else {
            capped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_delay() {
        let backoff = Backoff::from_policy(&RetryPolicy::constant(5, Duration::from_millis(100)));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(4), Duration::from_millis(100));
    }

    #[test]
    fn test_exponential_delay() {
        let backoff =
            Backoff::from_policy(&RetryPolicy::exponential(5, Duration::from_millis(100)));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_cap_applies() {
        let mut policy = RetryPolicy::exponential(10, Duration::from_millis(100));
        policy.max_interval = Some(Duration::from_millis(250));
        let backoff = Backoff::from_policy(&policy);

        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(250));
        assert_eq!(backoff.delay(8), Duration::from_millis(250));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut policy = RetryPolicy::constant(3, Duration::from_millis(100));
        policy.jitter = true;
        let backoff = Backoff::from_policy(&policy);

        for _ in 0..100 {
            assert!(backoff.delay(1) <= Duration::from_millis(100));
        }
    }
}
