//! Consumer lifecycle.
//!
//! `TypedEventConsumer` binds one queue to an [`EventHandler`] for a single
//! event type. `ConsumerManager` starts and stops a set of consumers as a
//! unit, matching the lifecycle of the hosting process.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerConsumer, ConsumedMessage, DEFAULT_PREFETCH};
use crate::bus::{EventHandler, HandlerError, HandlerResult, Result};
use crate::event::{DomainEvent, EventEnvelope};

/// A consumer with an explicit start/stop lifecycle.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Whether the consumer is currently registered with the broker.
    fn is_started(&self) -> bool;

    /// Register with the broker. Returns once startup is complete, not when
    /// message processing ends.
    async fn start_consuming(&self) -> Result<()>;

    /// Stop taking new messages and wait for in-flight handlers.
    async fn stop_consuming(&self) -> Result<()>;

    /// Release the underlying channel.
    async fn dispose(&self) -> Result<()>;
}

/// Consumes events of type `E` from one queue.
///
/// Message bodies are decoded as JSON into `E`. A body that does not decode
/// counts as a handler failure, so the message is dead-lettered.
pub struct TypedEventConsumer<E> {
    name: String,
    consumer: BrokerConsumer,
    queue: String,
    bindings: Vec<String>,
    prefetch: u16,
    handler: Arc<dyn EventHandler>,
    started: AtomicBool,
    _event: PhantomData<fn() -> E>,
}

impl<E: DomainEvent> TypedEventConsumer<E> {
    pub fn new(
        consumer: BrokerConsumer,
        queue: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        let queue = queue.into();
        Self {
            name: format!("{}@{}", E::event_type(), queue),
            consumer,
            queue,
            bindings: Vec::new(),
            prefetch: DEFAULT_PREFETCH,
            handler,
            started: AtomicBool::new(false),
            _event: PhantomData,
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Declare the queue with these bindings before consuming.
    pub fn with_bindings(mut self, bindings: Vec<String>) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    async fn start(&self) -> Result<()> {
        if !self.bindings.is_empty() {
            self.consumer.declare_queue(&self.queue, &self.bindings).await?;
        }

        let handler = Arc::clone(&self.handler);
        let decode = move |message: ConsumedMessage| {
            let handler = Arc::clone(&handler);
            async move {
                match message.json::<E>() {
                    Ok(event) => handler.handle(EventEnvelope::new(event)).await,
                    Err(e) => {
                        debug!(
                            event_type = E::event_type(),
                            routing_key = %message.routing_key,
                            error = %e,
                            "Failed to decode message body"
                        );
                        HandlerResult::Err(HandlerError::from(e))
                    }
                }
            }
        };

        self.consumer
            .start_consuming(&self.queue, Arc::new(decode), self.prefetch)
            .await
    }
}

#[async_trait]
impl<E: DomainEvent> EventConsumer for TypedEventConsumer<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn start_consuming(&self) -> Result<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!(consumer = %self.name, "Consumer already started");
            return Ok(());
        }

        if let Err(e) = self.start().await {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    async fn stop_consuming(&self) -> Result<()> {
        self.consumer.stop().await;
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        self.started.store(false, Ordering::SeqCst);
        self.consumer.dispose().await
    }
}

/// Starts and stops a set of consumers together.
#[derive(Default)]
pub struct ConsumerManager {
    consumers: Vec<Arc<dyn EventConsumer>>,
}

impl ConsumerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, consumer: Arc<dyn EventConsumer>) {
        self.consumers.push(consumer);
    }

    pub fn with_consumer(mut self, consumer: Arc<dyn EventConsumer>) -> Self {
        self.register(consumer);
        self
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Start every consumer concurrently and wait for all startups.
    ///
    /// If any consumer fails to start, the ones this call started are stopped
    /// again and the first error (in registration order) is returned.
    /// Consumers that were already running are left running.
    pub async fn start_all(&self) -> Result<()> {
        let already_running: Vec<bool> = self.consumers.iter().map(|c| c.is_started()).collect();
        let results = join_all(self.consumers.iter().map(|c| c.start_consuming())).await;
        if results.iter().all(Result::is_ok) {
            info!(count = self.consumers.len(), "All consumers started");
            return Ok(());
        }

        let started: Vec<_> = self
            .consumers
            .iter()
            .zip(results.iter().zip(&already_running))
            .filter(|(_, (result, running))| result.is_ok() && !**running)
            .map(|(consumer, _)| consumer)
            .collect();
        warn!(started = started.len(), "Consumer startup failed, stopping started consumers");
        for stop in join_all(started.iter().map(|c| c.stop_consuming())).await {
            if let Err(e) = stop {
                error!(error = %e, "Failed to stop consumer during rollback");
            }
        }

        first_failure(&self.consumers, results, "start")
    }

    /// Ask every consumer to stop and wait for all of them.
    ///
    /// Every consumer is stopped even if some fail; the first error is
    /// returned afterwards.
    pub async fn stop_all(&self) -> Result<()> {
        let results = join_all(self.consumers.iter().map(|c| c.stop_consuming())).await;
        let result = first_failure(&self.consumers, results, "stop");
        if result.is_ok() {
            info!(count = self.consumers.len(), "All consumers stopped");
        }
        result
    }

    /// Stop every consumer, then dispose them.
    pub async fn shutdown(&self) -> Result<()> {
        let stopped = self.stop_all().await;
        let results = join_all(self.consumers.iter().map(|c| c.dispose())).await;
        let disposed = first_failure(&self.consumers, results, "dispose");
        stopped.and(disposed)
    }
}

fn first_failure(
    consumers: &[Arc<dyn EventConsumer>],
    results: Vec<Result<()>>,
    action: &str,
) -> Result<()> {
    let mut first = None;
    for (consumer, result) in consumers.iter().zip(results) {
        if let Err(e) = result {
            error!(consumer = %consumer.name(), action, error = %e, "Consumer lifecycle call failed");
            first.get_or_insert(e);
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
