//! Broker consumer.
//!
//! Pulls messages from a queue and hands them to a [`MessageHandler`]:
//! - handler returns `Ok` → ack
//! - handler returns `Err` (or panics) → nack without requeue, so the broker
//!   dead-letters the message
//!
//! There is no retry here. Redelivery policy belongs to the broker topology
//! (see [`Topology::declare_retry_queue`]).

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(feature = "otel")]
use crate::utils::metrics::{self, outcome_attr, queue_attr, CONSUMER_MESSAGE_TOTAL};

use super::{
    BrokerChannel, BrokerConnector, DeliveryStream, Headers, InboundDelivery, Topology,
    TransportError, TransportResult, EVENT_TYPE_HEADER,
};
use crate::bus::{BusError, HandlerResult, Result};

/// Prefetch used when the caller has no preference: one message at a time,
/// in delivery order.
pub const DEFAULT_PREFETCH: u16 = 1;

/// A message as seen by a consumer handler.
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    pub body: Vec<u8>,
    pub routing_key: String,
    /// Value of the `x-event-type` header, if the publisher set one.
    pub event_type: Option<String>,
    pub redelivered: bool,
    pub headers: Headers,
}

impl ConsumedMessage {
    /// Body decoded as UTF-8, with invalid sequences replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body decoded as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

/// Handles messages consumed from a queue.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: ConsumedMessage) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(ConsumedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, message: ConsumedMessage) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(message))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How long a cancelled registration may take to hand back deliveries the
/// broker pushed before the cancel arrived.
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves once shutdown is signalled or the consumer is dropped.
async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Queue consumer over one broker channel.
///
/// One consumer may serve several queues; each `start_consuming` call spawns
/// its own delivery loop.
pub struct BrokerConsumer {
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    topology: Topology,
    shutdown: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl BrokerConsumer {
    /// Open a channel and declare the topology.
    pub async fn connect(connector: &dyn BrokerConnector, topology: Topology) -> Result<Self> {
        let channel = connector.open_channel().await.map_err(BusError::Connection)?;

        if let Err(e) = topology.declare(channel.as_ref()).await {
            error!(error = %e, "Failed to declare topology for consumer");
            let _ = channel.close().await;
            return Err(BusError::Connection(e));
        }

        let (shutdown, _) = watch::channel(false);
        info!(dead_letter_queue = %topology.dead_letter_queue, "Broker consumer connected");

        Ok(Self {
            channel: Mutex::new(Some(channel)),
            topology,
            shutdown,
            tasks: tokio::sync::Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    fn channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        lock(&self.channel).clone().ok_or_else(|| {
            BusError::Connection(TransportError::Unavailable(
                "consumer channel is not initialized".to_string(),
            ))
        })
    }

    /// Declare a consumer queue dead-lettering into the topology and bind it
    /// to the primary exchange.
    pub async fn declare_queue(&self, queue: &str, bindings: &[String]) -> Result<()> {
        let channel = self.channel()?;
        self.topology
            .declare_consumer_queue(channel.as_ref(), queue, bindings)
            .await
            .map_err(BusError::Connection)
    }

    async fn register(
        channel: &Arc<dyn BrokerChannel>,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> TransportResult<DeliveryStream> {
        channel.set_prefetch(prefetch).await?;
        channel.consume(queue, consumer_tag).await
    }

    /// Start consuming `queue`.
    ///
    /// Returns once the consumer is registered with the broker; messages are
    /// processed by a background task. Up to `prefetch` handlers run
    /// concurrently.
    pub async fn start_consuming(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        prefetch: u16,
    ) -> Result<()> {
        if queue.trim().is_empty() {
            return Err(BusError::InvalidArgument(
                "queue name must not be empty".to_string(),
            ));
        }
        if prefetch == 0 {
            return Err(BusError::InvalidArgument(
                "prefetch must be at least 1".to_string(),
            ));
        }

        let channel = self.channel()?;
        let consumer_tag = format!("courier-{}-{}", queue, uuid::Uuid::new_v4());
        let deliveries = Self::register(&channel, queue, &consumer_tag, prefetch)
            .await
            .map_err(BusError::Connection)?;

        let delivery_loop = DeliveryLoop {
            channel,
            queue: queue.to_string(),
            consumer_tag: consumer_tag.clone(),
            handler,
            prefetch,
            shutdown: self.shutdown.subscribe(),
        };
        let task = tokio::spawn(delivery_loop.run(deliveries));
        self.tasks.lock().await.push(task);

        info!(
            queue = %queue,
            consumer_tag = %consumer_tag,
            prefetch,
            "Consumer started"
        );
        Ok(())
    }

    /// Stop pulling new messages and wait for in-flight handlers to finish.
    ///
    /// Each registration is cancelled with the broker and anything it pushed
    /// but no handler saw is requeued. The consumer can be started again
    /// afterwards.
    pub async fn stop(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        if tasks.is_empty() {
            return;
        }

        self.shutdown.send_replace(true);
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Consumer task failed");
            }
        }
        self.shutdown.send_replace(false);

        info!("Consumer stopped");
    }

    /// Stop and close the channel. Disposing twice is a no-op.
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.stop().await;

        let channel = lock(&self.channel).take();
        if let Some(channel) = channel {
            channel.close().await.map_err(BusError::Connection)?;
        }

        info!("Consumer disposed");
        Ok(())
    }
}

impl Drop for BrokerConsumer {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// One queue's delivery loop.
struct DeliveryLoop {
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    consumer_tag: String,
    handler: Arc<dyn MessageHandler>,
    prefetch: u16,
    shutdown: watch::Receiver<bool>,
}

impl DeliveryLoop {
    /// Shutdown was signalled, or the owning consumer is gone.
    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    /// Process deliveries until shutdown. If the broker ends the stream
    /// (connection loss, channel closed), re-register with exponential
    /// backoff and jitter.
    async fn run(self, initial: DeliveryStream) {
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();
        let mut backoff = backoff_builder.build();
        let mut next_stream = Some(initial);

        loop {
            let deliveries = match next_stream.take() {
                Some(deliveries) => deliveries,
                None => {
                    match BrokerConsumer::register(
                        &self.channel,
                        &self.queue,
                        &self.consumer_tag,
                        self.prefetch,
                    )
                    .await
                    {
                        Ok(deliveries) => {
                            info!(queue = %self.queue, "Consumer re-registered");
                            deliveries
                        }
                        Err(e) => {
                            let delay = backoff.next().unwrap_or(Duration::from_secs(30));
                            error!(
                                queue = %self.queue,
                                error = %e,
                                backoff_ms = %delay.as_millis(),
                                "Failed to re-register consumer, retrying after backoff"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => continue,
                                _ = shutdown_signal(self.shutdown.clone()) => break,
                            }
                        }
                    }
                }
            };

            let this = &self;
            let mut delivered = false;
            let mut deliveries =
                deliveries.take_until(Box::pin(shutdown_signal(self.shutdown.clone())));
            deliveries
                .by_ref()
                .for_each_concurrent(usize::from(self.prefetch), |delivery| {
                    delivered = true;
                    async move {
                        match delivery {
                            Ok(delivery) => this.process(delivery).await,
                            Err(e) => {
                                error!(queue = %this.queue, error = %e, "Consumer delivery error")
                            }
                        }
                    }
                })
                .await;

            if deliveries.is_stopped() || self.is_shutting_down() {
                self.cancel(deliveries.into_inner()).await;
                break;
            }

            if delivered {
                backoff = backoff_builder.build();
            }
            let delay = backoff.next().unwrap_or(Duration::from_secs(30));
            warn!(
                queue = %self.queue,
                backoff_ms = %delay.as_millis(),
                "Delivery stream ended, re-registering consumer after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_signal(self.shutdown.clone()) => break,
            }
        }

        debug!(queue = %self.queue, "Delivery loop exited");
    }

    /// Cancel the registration and requeue whatever the broker pushed to it
    /// after shutdown, so the next registration receives those messages
    /// first.
    async fn cancel(&self, mut remaining: DeliveryStream) {
        if let Err(e) = self.channel.cancel(&self.consumer_tag).await {
            warn!(
                queue = %self.queue,
                consumer_tag = %self.consumer_tag,
                error = %e,
                "Failed to cancel consumer"
            );
            return;
        }

        let requeue = async {
            let mut requeued = 0usize;
            while let Some(delivery) = remaining.next().await {
                let Ok(delivery) = delivery else { continue };
                match delivery.acker.nack(true).await {
                    Ok(()) => requeued += 1,
                    Err(e) => warn!(queue = %self.queue, error = %e, "Failed to requeue message"),
                }
            }
            requeued
        };

        match tokio::time::timeout(CANCEL_DRAIN_TIMEOUT, requeue).await {
            Ok(0) => {}
            Ok(requeued) => debug!(queue = %self.queue, requeued, "Requeued undelivered messages"),
            Err(_) => warn!(
                queue = %self.queue,
                consumer_tag = %self.consumer_tag,
                "Cancelled consumer did not drain in time"
            ),
        }
    }

    async fn process(&self, delivery: InboundDelivery) {
        let event_type = delivery.header_str(EVENT_TYPE_HEADER).map(str::to_string);
        let InboundDelivery {
            body,
            routing_key,
            headers,
            redelivered,
            acker,
            ..
        } = delivery;

        let message = ConsumedMessage {
            body,
            routing_key: routing_key.clone(),
            event_type: event_type.clone(),
            redelivered,
            headers,
        };

        let outcome = AssertUnwindSafe(self.handler.handle(message))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err("message handler panicked".into()));

        #[cfg(feature = "otel")]
        CONSUMER_MESSAGE_TOTAL.add(
            1,
            &[
                queue_attr(&self.queue),
                outcome_attr(metrics::outcome(outcome.is_ok())),
            ],
        );

        match outcome {
            Ok(()) => {
                if let Err(e) = acker.ack().await {
                    error!(queue = %self.queue, error = %e, "Failed to ack message");
                    return;
                }
                debug!(
                    queue = %self.queue,
                    routing_key = %routing_key,
                    event_type = event_type.as_deref().unwrap_or("unknown"),
                    "Message acknowledged"
                );
            }
            Err(e) => {
                warn!(
                    queue = %self.queue,
                    routing_key = %routing_key,
                    event_type = event_type.as_deref().unwrap_or("unknown"),
                    redelivered,
                    error = %e,
                    "Handler failed, dead-lettering message"
                );
                if let Err(e) = acker.nack(false).await {
                    error!(queue = %self.queue, error = %e, "Failed to nack message");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, OutboundMessage};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    const QUEUE: &str = "biblioteca";

    async fn setup() -> (InMemoryBroker, BrokerConsumer, Arc<dyn BrokerChannel>) {
        let broker = InMemoryBroker::new();
        let consumer = BrokerConsumer::connect(&broker, Topology::default())
            .await
            .unwrap();
        consumer
            .declare_queue(QUEUE, &["game.*".to_string()])
            .await
            .unwrap();
        let publisher = broker.open_channel().await.unwrap();
        (broker, consumer, publisher)
    }

    async fn publish(channel: &Arc<dyn BrokerChannel>, body: &str) {
        channel
            .publish(
                "courier.events",
                "game.comprado",
                OutboundMessage::json(body.as_bytes().to_vec()).with_header(
                    EVENT_TYPE_HEADER,
                    crate::broker::HeaderValue::Str("GameComprado".to_string()),
                ),
            )
            .await
            .unwrap();
    }

    async fn eventually(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn settled(broker: &InMemoryBroker, queue: &str) -> bool {
        broker.message_count(queue) == 0 && broker.unacked_count(queue) == 0
    }

    #[tokio::test]
    async fn test_success_acks_message() {
        let (broker, consumer, publisher) = setup().await;
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        consumer
            .start_consuming(
                QUEUE,
                Arc::new(move |message: ConsumedMessage| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().unwrap().push(message);
                        HandlerResult::Ok(())
                    }
                }),
                DEFAULT_PREFETCH,
            )
            .await
            .unwrap();

        publish(&publisher, r#"{"game_id":"g-1"}"#).await;
        eventually(|| settled(&broker, QUEUE) && seen.lock().unwrap().len() == 1).await;

        let received = seen.lock().unwrap()[0].clone();
        assert_eq!(received.text(), r#"{"game_id":"g-1"}"#);
        assert_eq!(received.routing_key, "game.comprado");
        assert_eq!(received.event_type.as_deref(), Some("GameComprado"));
        assert!(!received.redelivered);
        let body: serde_json::Value = received.json().unwrap();
        assert_eq!(body["game_id"], "g-1");

        assert_eq!(broker.message_count("courier.dlq"), 0);
        consumer.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_dead_letters_without_redelivery() {
        let (broker, consumer, publisher) = setup().await;
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        consumer
            .start_consuming(
                QUEUE,
                Arc::new(move |_: ConsumedMessage| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { HandlerResult::Err("library service down".into()) }
                }),
                DEFAULT_PREFETCH,
            )
            .await
            .unwrap();

        publish(&publisher, "{}").await;
        eventually(|| broker.message_count("courier.dlq") == 1).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(settled(&broker, QUEUE));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        consumer.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_handler_dead_letters() {
        let (broker, consumer, publisher) = setup().await;

        consumer
            .start_consuming(
                QUEUE,
                Arc::new(|_: ConsumedMessage| async {
                    if true {
                        panic!("handler bug");
                    }
                    HandlerResult::Ok(())
                }),
                DEFAULT_PREFETCH,
            )
            .await
            .unwrap();

        publish(&publisher, "{}").await;
        eventually(|| broker.message_count("courier.dlq") == 1).await;
        consumer.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_prefetch_one_processes_in_order() {
        let (broker, consumer, publisher) = setup().await;
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            publish(&publisher, &i.to_string()).await;
        }

        let sink = Arc::clone(&order);
        consumer
            .start_consuming(
                QUEUE,
                Arc::new(move |message: ConsumedMessage| {
                    let sink = Arc::clone(&sink);
                    async move {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        sink.lock().unwrap().push(message.text());
                        HandlerResult::Ok(())
                    }
                }),
                1,
            )
            .await
            .unwrap();

        eventually(|| order.lock().unwrap().len() == 5).await;
        assert_eq!(*order.lock().unwrap(), vec!["0", "1", "2", "3", "4"]);
        eventually(|| settled(&broker, QUEUE)).await;
        consumer.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_prefetch_bounds_concurrency() {
        let (broker, consumer, publisher) = setup().await;
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..8 {
            publish(&publisher, &i.to_string()).await;
        }

        let (active_in, peak_in) = (Arc::clone(&active), Arc::clone(&peak));
        consumer
            .start_consuming(
                QUEUE,
                Arc::new(move |_: ConsumedMessage| {
                    let active = Arc::clone(&active_in);
                    let peak = Arc::clone(&peak_in);
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        HandlerResult::Ok(())
                    }
                }),
                3,
            )
            .await
            .unwrap();

        eventually(|| settled(&broker, QUEUE)).await;
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak > 1, "expected concurrent handlers, peak was {}", peak);
        assert!(peak <= 3, "prefetch exceeded, peak was {}", peak);
        consumer.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_handler() {
        let (broker, consumer, publisher) = setup().await;
        let started = Arc::new(Notify::new());
        let finished = Arc::new(AtomicBool::new(false));

        let (started_in, finished_in) = (Arc::clone(&started), Arc::clone(&finished));
        consumer
            .start_consuming(
                QUEUE,
                Arc::new(move |_: ConsumedMessage| {
                    let started = Arc::clone(&started_in);
                    let finished = Arc::clone(&finished_in);
                    async move {
                        started.notify_one();
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        finished.store(true, Ordering::SeqCst);
                        HandlerResult::Ok(())
                    }
                }),
                DEFAULT_PREFETCH,
            )
            .await
            .unwrap();

        publish(&publisher, "{}").await;
        started.notified().await;
        consumer.stop().await;

        assert!(finished.load(Ordering::SeqCst));
        assert!(settled(&broker, QUEUE));

        // Nothing is consumed after stop.
        publish(&publisher, "{}").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.message_count(QUEUE), 1);
        consumer.dispose().await.unwrap();
    }

    /// Counts registrations and cancels. `consume` yields either a stream
    /// that never produces or one that ends at once.
    struct CountingChannel {
        consumes: AtomicUsize,
        cancels: AtomicUsize,
        ends_immediately: bool,
    }

    impl CountingChannel {
        fn new(ends_immediately: bool) -> Arc<Self> {
            Arc::new(Self {
                consumes: AtomicUsize::new(0),
                cancels: AtomicUsize::new(0),
                ends_immediately,
            })
        }
    }

    #[async_trait::async_trait]
    impl BrokerChannel for CountingChannel {
        async fn declare_exchange(
            &self,
            _name: &str,
            _kind: crate::broker::ExchangeKind,
            _durable: bool,
        ) -> TransportResult<()> {
            Ok(())
        }

        async fn declare_queue(&self, _spec: &crate::broker::QueueSpec) -> TransportResult<()> {
            Ok(())
        }

        async fn bind_queue(&self, _queue: &str, _exchange: &str, _key: &str) -> TransportResult<()> {
            Ok(())
        }

        async fn publish(
            &self,
            _exchange: &str,
            _routing_key: &str,
            _message: OutboundMessage,
        ) -> TransportResult<()> {
            Ok(())
        }

        async fn set_prefetch(&self, _count: u16) -> TransportResult<()> {
            Ok(())
        }

        async fn consume(&self, _queue: &str, _tag: &str) -> TransportResult<DeliveryStream> {
            self.consumes.fetch_add(1, Ordering::SeqCst);
            if self.ends_immediately {
                Ok(futures::stream::empty().boxed())
            } else {
                Ok(futures::stream::pending().boxed())
            }
        }

        async fn cancel(&self, _consumer_tag: &str) -> TransportResult<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> TransportResult<()> {
            Ok(())
        }
    }

    struct CountingConnector(Arc<CountingChannel>);

    #[async_trait::async_trait]
    impl BrokerConnector for CountingConnector {
        async fn open_channel(&self) -> TransportResult<Arc<dyn BrokerChannel>> {
            Ok(Arc::clone(&self.0) as Arc<dyn BrokerChannel>)
        }
    }

    fn noop_handler() -> Arc<dyn MessageHandler> {
        Arc::new(|_: ConsumedMessage| async { HandlerResult::Ok(()) })
    }

    #[tokio::test]
    async fn test_dropped_consumer_cancels_instead_of_re_registering() {
        let channel = CountingChannel::new(false);
        let connector = CountingConnector(Arc::clone(&channel));
        let consumer = BrokerConsumer::connect(&connector, Topology::default())
            .await
            .unwrap();
        consumer
            .start_consuming(QUEUE, noop_handler(), DEFAULT_PREFETCH)
            .await
            .unwrap();

        drop(consumer);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(channel.consumes.load(Ordering::SeqCst), 1);
        assert_eq!(channel.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ended_stream_re_registers_after_backoff() {
        let channel = CountingChannel::new(true);
        let connector = CountingConnector(Arc::clone(&channel));
        let consumer = BrokerConsumer::connect(&connector, Topology::default())
            .await
            .unwrap();
        consumer
            .start_consuming(QUEUE, noop_handler(), DEFAULT_PREFETCH)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.consumes.load(Ordering::SeqCst), 1);

        eventually(|| channel.consumes.load(Ordering::SeqCst) >= 2).await;
        consumer.dispose().await.unwrap();
        let registrations = channel.consumes.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(channel.consumes.load(Ordering::SeqCst), registrations);
    }

    #[tokio::test]
    async fn test_restart_after_stop_receives_messages_published_while_stopped() {
        let (broker, consumer, publisher) = setup().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let sink = Arc::clone(&seen);
            Arc::new(move |message: ConsumedMessage| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(message.text());
                    HandlerResult::Ok(())
                }
            }) as Arc<dyn MessageHandler>
        };

        consumer
            .start_consuming(QUEUE, Arc::clone(&handler), 1)
            .await
            .unwrap();
        publish(&publisher, "0").await;
        eventually(|| seen.lock().unwrap().len() == 1).await;
        consumer.stop().await;

        publish(&publisher, "1").await;
        publish(&publisher, "2").await;
        consumer.start_consuming(QUEUE, handler, 1).await.unwrap();

        eventually(|| seen.lock().unwrap().len() == 3).await;
        assert_eq!(*seen.lock().unwrap(), vec!["0", "1", "2"]);
        eventually(|| settled(&broker, QUEUE)).await;
        consumer.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_after_dispose_is_connection_error() {
        let (_broker, consumer, _publisher) = setup().await;

        consumer.dispose().await.unwrap();
        consumer.dispose().await.unwrap();

        let result = consumer
            .start_consuming(
                QUEUE,
                Arc::new(|_: ConsumedMessage| async { HandlerResult::Ok(()) }),
                DEFAULT_PREFETCH,
            )
            .await;
        assert!(matches!(result, Err(BusError::Connection(_))));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_arguments() {
        let (_broker, consumer, _publisher) = setup().await;
        let handler: Arc<dyn MessageHandler> =
            Arc::new(|_: ConsumedMessage| async { HandlerResult::Ok(()) });

        assert!(matches!(
            consumer.start_consuming("", Arc::clone(&handler), 1).await,
            Err(BusError::InvalidArgument(_))
        ));
        assert!(matches!(
            consumer.start_consuming(QUEUE, handler, 0).await,
            Err(BusError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_start_on_missing_queue_fails() {
        let (_broker, consumer, _publisher) = setup().await;
        let result = consumer
            .start_consuming(
                "nonexistent",
                Arc::new(|_: ConsumedMessage| async { HandlerResult::Ok(()) }),
                1,
            )
            .await;
        assert!(matches!(
            result,
            Err(BusError::Connection(TransportError::NotFound(_)))
        ));
    }
}
