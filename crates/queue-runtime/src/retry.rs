//! Backoff between attempts of a queue transport call.
//!
//! [`StandardQueueClient`](crate::StandardQueueClient) consults the policy
//! whenever a provider call fails with a transient error. Delays double from
//! `base_delay` up to `max_delay`. Jitter spreads the retries of workers that
//! were throttled together.

use crate::provider::QueueConfig;
use rand::RngExt;
use std::time::Duration;

/// Largest share of a delay that jitter adds or removes
const JITTER_FRACTION: f64 = 0.25;

/// Retry budget and backoff for transient transport failures
///
/// ```rust
/// use queue_runtime::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(4, Duration::from_millis(250), Duration::from_secs(2)).without_jitter();
/// assert_eq!(policy.backoff(0), Duration::from_millis(250));
/// assert_eq!(policy.backoff(2), Duration::from_secs(1));
/// assert_eq!(policy.backoff(5), Duration::from_secs(2));
/// assert!(policy.allows_retry(3));
/// assert!(!policy.allows_retry(4));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first call; zero disables retrying
    pub max_retries: u32,

    pub base_delay: Duration,

    pub max_delay: Duration,

    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    /// Policy described by the retry fields of a client configuration
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(
            config.max_retry_attempts,
            config.retry_base_delay,
            config.retry_max_delay,
        )
    }

    /// Every failure is returned to the caller as is
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Whether retry number `retry` (0-based) is still within budget
    pub fn allows_retry(&self, retry: u32) -> bool {
        retry < self.max_retries
    }

    /// Wait before retry number `retry` (0-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2f64.powi(i32::try_from(retry).unwrap_or(i32::MAX));
        // A zero base times an infinite factor is NaN, which `min` discards
        let capped = (self.base_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());

        if self.jitter {
            Duration::from_secs_f64(jittered(capped))
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

fn jittered(seconds: f64) -> f64 {
    let spread = seconds * JITTER_FRACTION;
    if spread <= 0.0 {
        return seconds;
    }

    (seconds + rand::rng().random_range(-spread..=spread)).max(0.0)
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
