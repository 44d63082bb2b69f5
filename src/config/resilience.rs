//! Resilience decorator configuration.

use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

/// Timeout → circuit breaker → retry settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Wrap the configured bus in the resilience decorator.
    pub enabled: bool,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Upper bound for one publish, retries included.
    pub timeout_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            timeout_ms: 5_000,
        }
    }
}

impl ResilienceConfig {
    /// Calls to slow external services: longer timeout, a breaker that trips
    /// sooner and stays open longer, fixed exponential delays.
    pub fn external_service() -> Self {
        Self {
            enabled: true,
            retry: RetryConfig {
                max_retries: 3,
                base_delay_ms: 200,
                jitter_max_ms: 0,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                break_duration_ms: 60_000,
            },
            timeout_ms: 10_000,
        }
    }

    /// Message processing: aggressive retry with wide jitter.
    pub fn message_processing() -> Self {
        Self {
            enabled: true,
            retry: RetryConfig {
                max_retries: 5,
                base_delay_ms: 100,
                jitter_max_ms: 2_000,
            },
            circuit_breaker: CircuitBreakerConfig::default(),
            timeout_ms: 60_000,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "resilience.timeout_ms must be positive".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "resilience.circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry with exponential backoff and jitter.
///
/// Delay before retry `n` (1-based) is `base_delay * 2^n + uniform(0, jitter_max)`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub jitter_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            jitter_max_ms: 1_000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn jitter_max(&self) -> Duration {
        Duration::from_millis(self.jitter_max_ms)
    }
}

/// Consecutive-failure circuit breaker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed calls that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call.
    pub break_duration_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            break_duration_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn break_duration(&self) -> Duration {
        Duration::from_millis(self.break_duration_ms)
    }
}
