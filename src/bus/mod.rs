//! Event bus seam.
//!
//! This module contains:
//! - `EventBus` trait: publish + in-process subscription management
//! - `EventHandler` trait: async callbacks invoked with an event envelope
//! - `BusError`: the error taxonomy shared by every bus implementation
//! - `init_event_bus`: factory selecting an implementation from configuration
//!
//! Implementations:
//! - `InProcessEventBus`: synchronous-in-order fan-out within one process
//! - `BrokerEventBus` (in `crate::broker`): publish-only, backed by a broker
//! - `ResilientEventBus` (in `crate::resilience`): retry/breaker/timeout decorator

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::info;

use crate::broker::TransportError;
use crate::event::{DomainEvent, EventEnvelope};

pub mod in_process;

pub use in_process::{HandlerRegistry, InProcessEventBus};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Error returned by event handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a single handler invocation.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Connection failed: {0}")]
    Connection(#[source] TransportError),

    #[error("Publish failed: {0}")]
    Publish(#[source] TransportError),

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Circuit breaker is open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("Handler for '{event_type}' failed: {source}")]
    Handler {
        event_type: String,
        #[source]
        source: HandlerError,
    },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    /// Whether retrying the same call could succeed.
    ///
    /// Transient errors are retried by the resilience decorator and count
    /// towards its circuit breaker; everything else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::Connection(_) | BusError::Publish(_) | BusError::Handler { .. }
        )
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler for processing events from a bus.
pub trait EventHandler: Send + Sync {
    /// Process one event.
    fn handle(&self, event: EventEnvelope) -> BoxFuture<'static, HandlerResult>;
}

/// Typed handler built from an async closure. See [`handler_fn`].
pub struct FnHandler<E, F> {
    f: F,
    _event: PhantomData<fn(Arc<E>)>,
}

impl<E, F, Fut> EventHandler for FnHandler<E, F>
where
    E: DomainEvent,
    F: Fn(Arc<E>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, event: EventEnvelope) -> BoxFuture<'static, HandlerResult> {
        match event.downcast::<E>() {
            Some(typed) => Box::pin((self.f)(typed)),
            None => {
                let err: HandlerError = format!(
                    "handler for {} received a {} event",
                    E::event_type(),
                    event.event_type()
                )
                .into();
                Box::pin(futures::future::ready(HandlerResult::Err(err)))
            }
        }
    }
}

/// Build a shareable handler for events of type `E` from an async closure.
///
/// ```ignore
/// let handler = handler_fn(|event: Arc<GameComprado>| async move {
///     info!(game = %event.game_id, "library updated");
///     Ok(())
/// });
/// bus.subscribe_to::<GameComprado>(handler).await?;
/// ```
pub fn handler_fn<E, F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    E: DomainEvent,
    F: Fn(Arc<E>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _event: PhantomData,
    })
}

/// Identity comparison for registered handlers.
///
/// Compares data pointers only, so the same handler seen through different
/// vtables still matches.
pub(crate) fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

// ============================================================================
// Bus
// ============================================================================

/// Interface for publishing events and managing in-process subscriptions.
///
/// Broker-backed implementations are write-only and answer the subscription
/// operations with [`BusError::Unsupported`].
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event to every interested consumer.
    async fn publish(&self, event: EventEnvelope) -> Result<()>;

    /// Register a handler for an event type name.
    async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> Result<()>;

    /// Remove one registration of `handler` for an event type name.
    async fn unsubscribe(&self, event_type: &str, handler: &Arc<dyn EventHandler>) -> Result<()>;

    /// Number of handlers registered for an event type name.
    async fn handler_count(&self, event_type: &str) -> Result<usize>;
}

#[async_trait]
impl<T: EventBus + ?Sized> EventBus for Arc<T> {
    async fn publish(&self, event: EventEnvelope) -> Result<()> {
        (**self).publish(event).await
    }

    async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
        (**self).subscribe(event_type, handler).await
    }

    async fn unsubscribe(&self, event_type: &str, handler: &Arc<dyn EventHandler>) -> Result<()> {
        (**self).unsubscribe(event_type, handler).await
    }

    async fn handler_count(&self, event_type: &str) -> Result<usize> {
        (**self).handler_count(event_type).await
    }
}

/// Typed conveniences over [`EventBus`].
#[async_trait]
pub trait EventBusExt: EventBus {
    /// Wrap and publish a domain event.
    async fn publish_event<E: DomainEvent>(&self, event: E) -> Result<()> {
        self.publish(EventEnvelope::new(event)).await
    }

    /// Register a handler for events of type `E`.
    async fn subscribe_to<E: DomainEvent>(&self, handler: Arc<dyn EventHandler>) -> Result<()> {
        self.subscribe(E::event_type(), handler).await
    }

    /// Remove one registration of `handler` for events of type `E`.
    async fn unsubscribe_from<E: DomainEvent>(&self, handler: &Arc<dyn EventHandler>) -> Result<()> {
        self.unsubscribe(E::event_type(), handler).await
    }

    /// Number of handlers registered for events of type `E`.
    async fn handler_count_for<E: DomainEvent>(&self) -> Result<usize> {
        self.handler_count(E::event_type()).await
    }
}

impl<T: EventBus + ?Sized> EventBusExt for T {}

// ============================================================================
// Factory
// ============================================================================

/// Initialize an event bus from configuration.
///
/// Returns the implementation selected by `messaging.type`, wrapped in the
/// resilience decorator when `resilience.enabled` is set. AMQP requires the
/// `amqp` feature.
pub async fn init_event_bus(config: &crate::config::Config) -> Result<Arc<dyn EventBus>> {
    use crate::config::MessagingType;

    let bus: Arc<dyn EventBus> = match config.messaging.messaging_type {
        MessagingType::InProcess => {
            info!(messaging_type = "in_process", "Event bus initialized");
            Arc::new(InProcessEventBus::new())
        }
        MessagingType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                use crate::broker::amqp::AmqpConnector;
                use crate::broker::BrokerEventBus;

                let connector = AmqpConnector::new(&config.messaging.amqp)?;
                let bus = BrokerEventBus::connect(
                    &connector,
                    config.messaging.topology.to_topology(),
                    config.messaging.routing_table(),
                )
                .await?;
                info!(messaging_type = "amqp", "Event bus initialized");
                Arc::new(bus)
            }

            #[cfg(not(feature = "amqp"))]
            {
                return Err(BusError::Unsupported(
                    "AMQP support requires the 'amqp' feature",
                ));
            }
        }
    };

    if config.resilience.enabled {
        let resilient = crate::resilience::ResilientEventBus::from_config(bus, &config.resilience);
        return Ok(Arc::new(resilient));
    }

    Ok(bus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_transient_classification() {
        let transport = || TransportError::Unavailable("down".to_string());

        assert!(BusError::Connection(transport()).is_transient());
        assert!(BusError::Publish(transport()).is_transient());
        assert!(BusError::Handler {
            event_type: "X".to_string(),
            source: "boom".into(),
        }
        .is_transient());

        assert!(!BusError::InvalidArgument("x".to_string()).is_transient());
        assert!(!BusError::Unsupported("subscribe").is_transient());
        assert!(!BusError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!BusError::CircuitOpen {
            retry_after: Duration::from_secs(1)
        }
        .is_transient());
    }

    #[test]
    fn test_same_handler_is_identity() {
        let a = handler_fn(|_: Arc<Ping>| async { Ok(()) });
        let b = handler_fn(|_: Arc<Ping>| async { Ok(()) });

        assert!(same_handler(&a, &Arc::clone(&a)));
        assert!(!same_handler(&a, &b));
    }

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct Ping;
    impl DomainEvent for Ping {}

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct Pong;
    impl DomainEvent for Pong {}

    #[tokio::test]
    async fn test_fn_handler_rejects_wrong_event_type() {
        let handler = handler_fn(|_: Arc<Ping>| async { Ok(()) });

        assert!(handler.handle(EventEnvelope::new(Ping)).await.is_ok());
        let err = handler.handle(EventEnvelope::new(Pong)).await.unwrap_err();
        assert!(err.to_string().contains("Pong"));
    }

    #[tokio::test]
    async fn test_init_event_bus_defaults_to_in_process() {
        let bus = init_event_bus(&Config::default()).await.unwrap();

        bus.subscribe_to::<Ping>(handler_fn(|_: Arc<Ping>| async { Ok(()) }))
            .await
            .unwrap();
        assert_eq!(bus.handler_count_for::<Ping>().await.unwrap(), 1);
    }
}
