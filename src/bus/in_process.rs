//! In-process event bus implementation.
//!
//! Routes events directly to handlers registered in the same process.
//! Handlers for one event are awaited one after another in registration
//! order; the first failing handler aborts the fan-out and its error is
//! returned to the publisher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{same_handler, BusError, EventBus, EventHandler, Result};
use crate::event::EventEnvelope;

/// Handler registrations keyed by event type name.
///
/// The registry owns its lock. Buses share a registry by sharing the `Arc`,
/// and get an isolated one from [`HandlerRegistry::new`].
///
/// Registrations form a multiset: subscribing the same handler twice means it
/// runs twice per publish, and each unsubscribe removes one registration.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking handler never runs under this lock, so a poisoned map is
    // still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Arc<dyn EventHandler>>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a handler for an event type.
    pub fn add(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        self.lock()
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
    }

    /// Remove the first registration of `handler`. Returns whether one was found.
    pub fn remove(&self, event_type: &str, handler: &Arc<dyn EventHandler>) -> bool {
        let mut handlers = self.lock();
        let Some(registered) = handlers.get_mut(event_type) else {
            return false;
        };

        let removed = match registered.iter().position(|h| same_handler(h, handler)) {
            Some(idx) => {
                registered.remove(idx);
                true
            }
            None => false,
        };

        if registered.is_empty() {
            handlers.remove(event_type);
        }
        removed
    }

    /// Copy of the current handler list for an event type.
    pub fn snapshot(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        self.lock().get(event_type).cloned().unwrap_or_default()
    }

    /// Number of registrations for an event type.
    pub fn count(&self, event_type: &str) -> usize {
        self.lock().get(event_type).map_or(0, Vec::len)
    }
}

/// In-process event bus.
///
/// Ideal for:
/// - Single-process applications
/// - Testing
/// - Embedded use cases
pub struct InProcessEventBus {
    registry: Arc<HandlerRegistry>,
}

impl InProcessEventBus {
    /// Create a bus with its own registry.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(HandlerRegistry::new()))
    }

    /// Create a bus over an existing registry.
    pub fn with_registry(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    /// The registry backing this bus.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }
}

impl Default for InProcessEventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn require_event_type(event_type: &str) -> Result<()> {
    if event_type.trim().is_empty() {
        return Err(BusError::InvalidArgument(
            "event type name must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl EventBus for InProcessEventBus {
    async fn publish(&self, event: EventEnvelope) -> Result<()> {
        event.validate()?;
        let event_type = event.event_type();

        // Snapshot under the lock, run handlers without it.
        let handlers = self.registry.snapshot(event_type);
        if handlers.is_empty() {
            debug!(event_type = %event_type, "No handlers registered, dropping event");
            return Ok(());
        }

        for (position, handler) in handlers.iter().enumerate() {
            if let Err(e) = handler.handle(event.clone()).await {
                warn!(
                    event_type = %event_type,
                    handler.position = position,
                    handler.total = handlers.len(),
                    error = %e,
                    "Handler failed, aborting fan-out"
                );
                return Err(BusError::Handler {
                    event_type: event_type.to_string(),
                    source: e,
                });
            }
        }

        debug!(
            event_type = %event_type,
            handler_count = handlers.len(),
            "Event dispatched"
        );
        Ok(())
    }

    async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
        require_event_type(event_type)?;
        self.registry.add(event_type, handler);
        info!(event_type = %event_type, "Registered in-process handler");
        Ok(())
    }

    async fn unsubscribe(&self, event_type: &str, handler: &Arc<dyn EventHandler>) -> Result<()> {
        require_event_type(event_type)?;
        if self.registry.remove(event_type, handler) {
            info!(event_type = %event_type, "Removed in-process handler");
        }
        Ok(())
    }

    async fn handler_count(&self, event_type: &str) -> Result<usize> {
        Ok(self.registry.count(event_type))
    }
}
