//! Jittered exponential retry schedule.

use std::time::Duration;

use backon::BackoffBuilder;
use rand::Rng;

use crate::config::RetryConfig;

/// Builds [`JitteredExponential`] schedules.
///
/// Retry `n` (1-based) waits `base * 2^n + uniform(0, jitter_max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitteredExponentialBuilder {
    base: Duration,
    jitter_max: Duration,
    max_retries: usize,
}

impl JitteredExponentialBuilder {
    pub fn new(base: Duration, jitter_max: Duration, max_retries: usize) -> Self {
        Self {
            base,
            jitter_max,
            max_retries,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.base_delay(), config.jitter_max(), config.max_retries)
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Delay before retry `attempt` without jitter.
    pub fn exponential_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor)
    }
}

impl BackoffBuilder for JitteredExponentialBuilder {
    type Backoff = JitteredExponential;

    fn build(self) -> Self::Backoff {
        JitteredExponential {
            builder: self,
            attempt: 0,
        }
    }
}

/// Finite iterator of retry delays.
#[derive(Debug)]
pub struct JitteredExponential {
    builder: JitteredExponentialBuilder,
    attempt: usize,
}

impl Iterator for JitteredExponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.builder.max_retries {
            return None;
        }
        self.attempt += 1;

        let exponent = u32::try_from(self.attempt).unwrap_or(u32::MAX);
        let delay = self.builder.exponential_delay(exponent);
        let jitter_ms = u64::try_from(self.builder.jitter_max.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return Some(delay);
        }
        let jitter = Duration::from_millis(rand::rng().random_range(0..jitter_ms));
        Some(delay.saturating_add(jitter))
    }
}
