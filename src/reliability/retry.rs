use crate::app::config::RetryConfig;
use crate::domain::HecError;
use clap::ValueEnum;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the redrive delay grows with each attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryStrategy {
    #[default]
    ExponentialBackoff,
    LinearBackoff,
    FixedDelay,
}

/// Redrive budget and backoff for batches that failed on a channel.
///
/// `attempts` counts dispatches of a batch, so the first post is attempt 1
/// and `max_attempts` in the config is the number of redrives on top of it.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn strategy(&self) -> RetryStrategy {
        self.config.strategy
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn should_give_up(&self, attempts: u32) -> bool {
        attempts.saturating_sub(1) >= self.config.max_attempts
    }

    pub fn should_redrive(&self, error: &HecError, attempts: u32) -> bool {
        error.is_retryable() && !self.should_give_up(attempts)
    }

    /// Delay before redrive number `retry` (1-based).
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        let base_ms = self.config.base_delay.as_millis() as u64;
        let exponent = retry.saturating_sub(1).min(32);
        let delay = match self.config.strategy {
            RetryStrategy::ExponentialBackoff => {
                Duration::from_millis(base_ms.saturating_mul(1_u64 << exponent))
            }
            RetryStrategy::LinearBackoff => {
                Duration::from_millis(base_ms.saturating_mul(retry.max(1) as u64))
            }
            RetryStrategy::FixedDelay => self.config.base_delay,
        };

        let capped = delay.min(self.config.max_delay);
        if self.config.jitter {
            apply_jitter(capped)
        } else {
            capped
        }
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    let jitter_factor = rand::rng().random_range(0.5..1.5);
    Duration::from_millis((delay.as_millis() as f64 * jitter_factor) as u64)
}
