//! Bounded exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Backoff policy shared by the cursor reopen path and the bulk retry path.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling on any single delay.
    pub max_delay: Duration,
    /// Retries allowed before the failure escalates to fatal.
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_retries: 8,
        }
    }
}

/// One retry sequence. Create a fresh instance per operation; call
/// [`Backoff::next_delay`] after each failure and stop when it returns
/// `None`.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next retry, or `None` once the ceiling is reached.
    ///
    /// Delays double per attempt, capped at `max_delay`, with +/-20% jitter
    /// so reconnecting replicas do not stampede.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_retries {
            return None;
        }
        let exp = self
            .config
            .base_delay
            .saturating_mul(1u32.checked_shl(self.attempt).unwrap_or(u32::MAX))
            .min(self.config.max_delay);
        self.attempt += 1;

        let jitter = rand::rng().random_range(0.8..1.2);
        Some(exp.mul_f64(jitter))
    }

    /// Retries consumed so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Reset after a success so the next failure starts from the base delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
