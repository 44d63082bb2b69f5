//! Resilience decorator for event buses.
//!
//! `ResilientEventBus` wraps any [`EventBus`] and composes, from the outside
//! in: a timeout over the whole publish, a circuit breaker, and a retry loop
//! with jittered exponential backoff around the inner publish.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use tracing::{debug, warn};

#[cfg(feature = "otel")]
use crate::utils::metrics::{event_type_attr, CIRCUIT_REJECTED_TOTAL, RETRY_TOTAL};

use crate::bus::{BusError, EventBus, EventHandler, Result};
use crate::config::ResilienceConfig;
use crate::event::EventEnvelope;

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{CallGuard, CircuitBreaker, CircuitState};
pub use retry::{JitteredExponential, JitteredExponentialBuilder};

/// Event bus decorator applying timeout, circuit breaker and retry to
/// `publish`. Subscription calls pass straight through.
pub struct ResilientEventBus<B> {
    inner: B,
    backoff: JitteredExponentialBuilder,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl<B: EventBus> ResilientEventBus<B> {
    pub fn new(
        inner: B,
        backoff: JitteredExponentialBuilder,
        breaker: CircuitBreaker,
        timeout: Duration,
    ) -> Self {
        Self {
            inner,
            backoff,
            breaker,
            timeout,
        }
    }

    pub fn from_config(inner: B, config: &ResilienceConfig) -> Self {
        Self::new(
            inner,
            JitteredExponentialBuilder::from_config(&config.retry),
            CircuitBreaker::new(
                config.circuit_breaker.failure_threshold,
                config.circuit_breaker.break_duration(),
            ),
            config.timeout(),
        )
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    async fn publish_with_retry(&self, event: &EventEnvelope) -> Result<()> {
        let inner = &self.inner;
        let max_retries = self.backoff.max_retries();
        let mut attempt = 0usize;

        (move || async move { inner.publish(event.clone()).await })
            .retry(self.backoff)
            .sleep(tokio::time::sleep)
            .when(BusError::is_transient)
            .notify(|e: &BusError, delay: Duration| {
                attempt += 1;
                warn!(
                    event_type = event.event_type(),
                    attempt,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Publish failed, retrying"
                );
                #[cfg(feature = "otel")]
                RETRY_TOTAL.add(1, &[event_type_attr(event.event_type())]);
            })
            .await
    }

    async fn guarded_publish(&self, event: &EventEnvelope) -> Result<()> {
        let guard = match self.breaker.try_acquire() {
            Ok(guard) => guard,
            Err(e) => {
                debug!(event_type = event.event_type(), "Circuit open, publish rejected");
                #[cfg(feature = "otel")]
                CIRCUIT_REJECTED_TOTAL.add(1, &[event_type_attr(event.event_type())]);
                return Err(e);
            }
        };

        match self.publish_with_retry(event).await {
            Ok(()) => {
                guard.success();
                Ok(())
            }
            Err(e) if e.is_transient() => {
                guard.failure();
                Err(e)
            }
            Err(e) => {
                guard.ignore();
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<B: EventBus> EventBus for ResilientEventBus<B> {
    async fn publish(&self, event: EventEnvelope) -> Result<()> {
        match tokio::time::timeout(self.timeout, self.guarded_publish(&event)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    event_type = event.event_type(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Publish timed out"
                );
                Err(BusError::Timeout(self.timeout))
            }
        }
    }

    async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
        self.inner.subscribe(event_type, handler).await
    }

    async fn unsubscribe(&self, event_type: &str, handler: &Arc<dyn EventHandler>) -> Result<()> {
        self.inner.unsubscribe(event_type, handler).await
    }

    async fn handler_count(&self, event_type: &str) -> Result<usize> {
        self.inner.handler_count(event_type).await
    }
}
