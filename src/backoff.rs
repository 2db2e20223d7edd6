//! # Backoff Policy
//!
//! Pure mapping from an event's error count to its next retry instant. The
//! default is capped exponential growth; the policy is replaceable as
//! configuration.
//!
//! Handler-provided backoff hints are reconciled with the policy output
//! latest-wins by the event state machine: a shorter hint never shortens an
//! effective backoff already produced by the policy.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Maps an error count to the next retry instant.
pub trait BackoffPolicy: Send + Sync {
    fn next_retry_at(&self, error_count: u32) -> DateTime<Utc>;
}

/// Capped exponential backoff: `now + min(base · multiplier^errors, cap)`.
///
/// Defaults yield the schedule 2 s, 4 s, 8 s, ... capped at 60 s.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Base delay scaled by the exponential term.
    pub base_delay: Duration,
    /// Upper bound on any computed delay.
    pub max_delay: Duration,
    /// Exponential growth factor.
    pub multiplier: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl ExponentialBackoff {
    /// The delay component, without the anchoring `now`.
    pub fn delay_for(&self, error_count: u32) -> Duration {
        let exp = self.multiplier.powi(error_count.min(i32::MAX as u32) as i32);
        let millis = self.base_delay.as_millis() as f64 * exp;
        if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            self.max_delay
        } else {
            Duration::from_millis(millis as u64)
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn next_retry_at(&self, error_count: u32) -> DateTime<Utc> {
        let delay = self.delay_for(error_count);
        Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_doubles_from_two_seconds() {
        let policy = ExponentialBackoff::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
    }

    #[test]
    fn delay_is_capped() {
        let policy = ExponentialBackoff::default();
        assert_eq!(policy.delay_for(6), Duration::from_secs(60));
        assert_eq!(policy.delay_for(63), Duration::from_secs(60));
        assert_eq!(policy.delay_for(500), Duration::from_secs(60));
    }

    #[test]
    fn retry_instant_is_strictly_in_the_future() {
        let policy = ExponentialBackoff::default();
        let before = Utc::now();
        let at = policy.next_retry_at(1);
        assert!(at > before);
    }

    #[test]
    fn custom_base_and_cap_are_honored() {
        let policy = ExponentialBackoff {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
    }
}
