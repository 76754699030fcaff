//! When to retry a failed model request, and how long to wait first.

use std::time::Duration;

use super::LlmError;

/// Retry policy for transient model errors.
///
/// Delays grow by doubling from `base_delay` up to `max_delay`. A server
/// supplied `Retry-After` is honoured when it asks for a longer wait.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomise each delay within its upper half.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Fixed short delays, for tests against local servers.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Wait before retry number `attempt` (1-based) after `error`, or `None`
    /// when the request should fail.
    pub fn next_delay(&self, attempt: u32, error: &LlmError) -> Option<Duration> {
        if attempt > self.max_retries || !error.is_retryable() {
            return None;
        }
        let delay = self.backoff(attempt);
        Some(error.retry_after().map_or(delay, |after| after.max(delay)))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        let capped = self
            .base_delay
            .saturating_mul(1 << doublings)
            .min(self.max_delay);
        if !self.jitter {
            return capped;
        }
        let half = capped / 2;
        half + half.mul_f64(rand::random::<f64>())
    }
}
