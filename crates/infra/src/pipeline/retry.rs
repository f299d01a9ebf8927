//! How long a job stays invisible after a transient stage failure.
//!
//! The retry budget lives on the job (`retry_count` / `max_retries`). This
//! only turns the retry number into a queue `nack` delay.

use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Same delay for every retry.
    Fixed,
    /// `base_delay` doubled per retry, up to `max_delay`.
    #[default]
    Exponential,
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffStrategy::Fixed),
            "exponential" => Ok(BackoffStrategy::Exponential),
            other => Err(format!("unknown backoff strategy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Up to this share of the delay is taken off, varying with the retry
    /// number, so jobs that failed together do not come back together.
    pub jitter_percent: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            jitter_percent: 10,
        }
    }
}

impl RetryPolicy {
    /// No delay at all; for tests and local runs.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
            jitter_percent: 0,
        }
    }

    /// Delay before redelivering a job on its `retry`-th retry (1-based).
    pub fn requeue_delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        }
        .min(self.max_delay);

        let spread = delay / 100 * u32::from(self.jitter_percent.min(100));
        let share = retry.wrapping_mul(37) % 100;
        delay.saturating_sub(spread / 100 * share)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exponential(base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            jitter_percent: 0,
        }
    }

    #[test]
    fn exponential_doubles_until_the_cap() {
        let policy = exponential(100, 1_000);
        let delays: Vec<u128> = (1..=6).map(|n| policy.requeue_delay(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(policy.requeue_delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_only_shortens_the_delay() {
        let policy = RetryPolicy {
            jitter_percent: 50,
            ..exponential(1_000, 5_000)
        };
        for retry in 1..50 {
            let plain = exponential(1_000, 5_000).requeue_delay(retry);
            let jittered = policy.requeue_delay(retry);
            assert!(jittered <= plain);
            assert!(jittered >= plain / 2);
        }
    }

    #[test]
    fn fixed_and_immediate() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500));
        assert_eq!(policy.requeue_delay(1), Duration::from_millis(500));
        assert_eq!(policy.requeue_delay(7), Duration::from_millis(500));
        assert_eq!(RetryPolicy::immediate().requeue_delay(3), Duration::ZERO);
        assert_eq!(RetryPolicy::default().requeue_delay(0), Duration::ZERO);
    }

    #[test]
    fn strategy_parses_from_config_text() {
        assert_eq!("Fixed".parse::<BackoffStrategy>(), Ok(BackoffStrategy::Fixed));
        assert_eq!("exponential".parse::<BackoffStrategy>(), Ok(BackoffStrategy::Exponential));
        assert!("linear".parse::<BackoffStrategy>().is_err());
    }
}
