//! In-memory broker.
//!
//! Implements the broker seam without a server, following the routing and
//! dead-letter rules of an AMQP 0-9-1 broker:
//! - topic exchanges (`*` matches one word, `#` zero or more), direct
//!   exchanges, and the default exchange `""` routing to the queue of the
//!   same name
//! - equivalence checks on re-declare
//! - per-consumer prefetch limits
//! - ack / nack / requeue, unsettled deliveries requeued when dropped
//! - dead-lettering with `x-death` headers, per-queue message TTL
//!
//! Fault injection (`set_available`, `fail_next_publishes`) and inspection
//! (`message_count`, `messages`, ...) make it the broker of choice for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::{
    Acker, BrokerChannel, BrokerConnector, DeliveryStream, ExchangeKind, HeaderValue, Headers,
    InboundDelivery, OutboundMessage, QueueSpec, TransportError, TransportResult, DEATH_HEADER,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Snapshot of a message waiting in a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub content_type: Option<String>,
    pub persistent: bool,
    pub redelivered: bool,
}

impl QueuedMessage {
    /// Body as UTF-8 text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone)]
struct Message {
    id: u64,
    exchange: String,
    routing_key: String,
    payload: OutboundMessage,
    redelivered: bool,
}

impl Message {
    fn snapshot(&self) -> QueuedMessage {
        QueuedMessage {
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            body: self.payload.body.clone(),
            headers: self.payload.headers.clone(),
            content_type: self.payload.content_type.clone(),
            persistent: self.payload.persistent,
            redelivered: self.redelivered,
        }
    }
}

struct Exchange {
    kind: ExchangeKind,
    durable: bool,
    /// (queue, pattern)
    bindings: Vec<(String, String)>,
}

struct Queue {
    spec: QueueSpec,
    ready: VecDeque<Message>,
    unacked: usize,
    notify: Arc<Notify>,
}

/// Pending TTL expiry for one enqueued message.
struct Expiry {
    queue: String,
    message_id: u64,
    after: Duration,
}

#[derive(Default)]
struct State {
    unavailable: bool,
    failing_publishes: usize,
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    next_message_id: u64,
}

impl State {
    fn check_available(&self) -> TransportResult<()> {
        if self.unavailable {
            return Err(TransportError::Unavailable(
                "in-memory broker is unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn declare_exchange(&mut self, name: &str, kind: ExchangeKind, durable: bool) -> TransportResult<()> {
        if name.is_empty() {
            return Err(TransportError::PreconditionFailed(
                "the default exchange cannot be redeclared".to_string(),
            ));
        }
        match self.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.durable != durable => {
                Err(TransportError::PreconditionFailed(format!(
                    "inequivalent arguments for exchange '{}'",
                    name
                )))
            }
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn declare_queue(&mut self, spec: &QueueSpec) -> TransportResult<()> {
        if spec.name.is_empty() {
            return Err(TransportError::Protocol(
                "queue name must not be empty".to_string(),
            ));
        }
        match self.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(TransportError::PreconditionFailed(
                format!("inequivalent arguments for queue '{}'", spec.name),
            )),
            Some(_) => Ok(()),
            None => {
                self.queues.insert(
                    spec.name.clone(),
                    Queue {
                        spec: spec.clone(),
                        ready: VecDeque::new(),
                        unacked: 0,
                        notify: Arc::new(Notify::new()),
                    },
                );
                Ok(())
            }
        }
    }

    fn bind_queue(&mut self, queue: &str, exchange: &str, pattern: &str) -> TransportResult<()> {
        if !self.queues.contains_key(queue) {
            return Err(TransportError::NotFound(format!("queue '{}'", queue)));
        }
        let target = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| TransportError::NotFound(format!("exchange '{}'", exchange)))?;

        let binding = (queue.to_string(), pattern.to_string());
        if !target.bindings.contains(&binding) {
            target.bindings.push(binding);
        }
        Ok(())
    }

    /// Route a message to every matching queue.
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: &OutboundMessage,
    ) -> TransportResult<Vec<Expiry>> {
        let targets: Vec<String> = if exchange.is_empty() {
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let source = self
                .exchanges
                .get(exchange)
                .ok_or_else(|| TransportError::NotFound(format!("exchange '{}'", exchange)))?;

            let mut targets: Vec<String> = Vec::new();
            for (queue, pattern) in &source.bindings {
                let matched = match source.kind {
                    ExchangeKind::Topic => topic_matches(pattern, routing_key),
                    ExchangeKind::Direct => pattern == routing_key,
                };
                if matched && !targets.contains(queue) {
                    targets.push(queue.clone());
                }
            }
            targets
        };

        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "Message unroutable, dropped");
        }

        let mut expiries = Vec::new();
        for queue in targets {
            self.next_message_id += 1;
            let message = Message {
                id: self.next_message_id,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload: payload.clone(),
                redelivered: false,
            };
            expiries.extend(self.enqueue(&queue, message));
        }
        Ok(expiries)
    }

    fn enqueue(&mut self, queue_name: &str, message: Message) -> Option<Expiry> {
        let queue = self.queues.get_mut(queue_name)?;
        let expiry = queue.spec.message_ttl.map(|after| Expiry {
            queue: queue_name.to_string(),
            message_id: message.id,
            after,
        });
        queue.ready.push_back(message);
        queue.notify.notify_waiters();
        expiry
    }

    fn requeue(&mut self, queue_name: &str, mut message: Message) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        message.redelivered = true;
        queue.ready.push_front(message);
        queue.notify.notify_waiters();
    }

    /// Move a message to its queue's dead-letter exchange, if it has one.
    fn dead_letter(&mut self, queue_name: &str, message: Message, reason: &str) -> Vec<Expiry> {
        let Some(spec) = self.queues.get(queue_name).map(|q| q.spec.clone()) else {
            return Vec::new();
        };
        let Some(dead_letter_exchange) = spec.dead_letter_exchange else {
            debug!(queue = %queue_name, reason, "No dead-letter exchange, message dropped");
            return Vec::new();
        };

        let routing_key = spec
            .dead_letter_routing_key
            .unwrap_or_else(|| message.routing_key.clone());
        let mut payload = message.payload;
        record_death(
            &mut payload.headers,
            queue_name,
            reason,
            &message.exchange,
            &message.routing_key,
        );

        match self.route(&dead_letter_exchange, &routing_key, &payload) {
            Ok(expiries) => expiries,
            Err(e) => {
                warn!(
                    queue = %queue_name,
                    dead_letter_exchange = %dead_letter_exchange,
                    error = %e,
                    "Dead-lettering failed, message dropped"
                );
                Vec::new()
            }
        }
    }
}

/// Add or bump the `x-death` entry for (queue, reason). Newest entry first.
fn record_death(headers: &mut Headers, queue: &str, reason: &str, exchange: &str, routing_key: &str) {
    let mut deaths = match headers.remove(DEATH_HEADER) {
        Some(HeaderValue::List(deaths)) => deaths,
        _ => Vec::new(),
    };

    let same_entry = |death: &HeaderValue| match death {
        HeaderValue::Table(entry) => {
            entry.get("queue") == Some(&HeaderValue::Str(queue.to_string()))
                && entry.get("reason") == Some(&HeaderValue::Str(reason.to_string()))
        }
        _ => false,
    };

    let entry = match deaths.iter().position(same_entry) {
        Some(idx) => {
            let mut entry = deaths.remove(idx);
            if let HeaderValue::Table(fields) = &mut entry {
                let count = match fields.get("count") {
                    Some(HeaderValue::Int(count)) => *count,
                    _ => 0,
                };
                fields.insert("count".to_string(), HeaderValue::Int(count + 1));
            }
            entry
        }
        None => {
            let mut fields = Headers::new();
            fields.insert("queue".to_string(), HeaderValue::Str(queue.to_string()));
            fields.insert("reason".to_string(), HeaderValue::Str(reason.to_string()));
            fields.insert("count".to_string(), HeaderValue::Int(1));
            fields.insert("exchange".to_string(), HeaderValue::Str(exchange.to_string()));
            fields.insert(
                "routing-keys".to_string(),
                HeaderValue::List(vec![HeaderValue::Str(routing_key.to_string())]),
            );
            HeaderValue::Table(fields)
        }
    };

    deaths.insert(0, entry);
    headers.insert(DEATH_HEADER.to_string(), HeaderValue::List(deaths));
}

/// Topic pattern match on dot-separated words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn expire(self: &Arc<Self>, queue_name: &str, message_id: u64) {
        let expiries = {
            let mut state = self.state();
            let Some(queue) = state.queues.get_mut(queue_name) else {
                return;
            };
            // Already delivered or dead-lettered.
            let Some(position) = queue.ready.iter().position(|m| m.id == message_id) else {
                return;
            };
            let Some(message) = queue.ready.remove(position) else {
                return;
            };
            debug!(queue = %queue_name, "Message expired");
            state.dead_letter(queue_name, message, "expired")
        };
        schedule_expiries(self, expiries);
    }
}

fn schedule_expiries(shared: &Arc<Shared>, expiries: Vec<Expiry>) {
    if expiries.is_empty() {
        return;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("No runtime available, message TTL not enforced");
        return;
    };
    for expiry in expiries {
        let shared = Arc::clone(shared);
        runtime.spawn(async move {
            tokio::time::sleep(expiry.after).await;
            shared.expire(&expiry.queue, expiry.message_id);
        });
    }
}

/// In-process broker. Clones share the same exchanges and queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Simulate losing (or regaining) the broker. While unavailable, opening
    /// channels and every channel operation fail with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.shared.state().unavailable = !available;
    }

    /// Fail the next `count` publishes with `Unavailable`.
    pub fn fail_next_publishes(&self, count: usize) {
        self.shared.state().failing_publishes = count;
    }

    /// Messages ready for delivery in a queue. Unknown queues count as empty.
    pub fn message_count(&self, queue: &str) -> usize {
        self.shared
            .state()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from a queue and not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared.state().queues.get(queue).map_or(0, |q| q.unacked)
    }

    /// Ready messages in a queue, in delivery order.
    pub fn messages(&self, queue: &str) -> Vec<QueuedMessage> {
        self.shared
            .state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(Message::snapshot).collect())
            .unwrap_or_default()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.shared.state().exchanges.contains_key(name)
    }

    pub fn queue_spec(&self, queue: &str) -> Option<QueueSpec> {
        self.shared.state().queues.get(queue).map(|q| q.spec.clone())
    }

    /// (queue, pattern) bindings of an exchange.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.shared
            .state()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn open_channel(&self) -> TransportResult<Arc<dyn BrokerChannel>> {
        self.shared.state().check_available()?;
        let (closed, _) = watch::channel(false);
        Ok(Arc::new(MemoryChannel {
            shared: Arc::clone(&self.shared),
            prefetch: AtomicU16::new(0),
            closed,
            consumers: Mutex::new(HashMap::new()),
        }))
    }
}

/// Channel on an [`InMemoryBroker`].
pub struct MemoryChannel {
    shared: Arc<Shared>,
    /// 0 means unlimited.
    prefetch: AtomicU16,
    closed: watch::Sender<bool>,
    consumers: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> TransportResult<()> {
        if *self.closed.borrow() {
            return Err(TransportError::Unavailable("channel is closed".to_string()));
        }
        Ok(())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> TransportResult<T>) -> TransportResult<T> {
        self.ensure_open()?;
        let mut state = self.shared.state();
        state.check_available()?;
        f(&mut state)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> TransportResult<()> {
        self.with_state(|state| state.declare_exchange(name, kind, durable))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> TransportResult<()> {
        self.with_state(|state| state.declare_queue(spec))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()> {
        self.with_state(|state| state.bind_queue(queue, exchange, routing_key))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> TransportResult<()> {
        let expiries = self.with_state(|state| {
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(TransportError::Unavailable(
                    "injected publish failure".to_string(),
                ));
            }
            state.route(exchange, routing_key, &message)
        })?;
        schedule_expiries(&self.shared, expiries);
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> TransportResult<()> {
        self.ensure_open()?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> TransportResult<DeliveryStream> {
        let notify = self.with_state(|state| {
            state
                .queues
                .get(queue)
                .map(|q| Arc::clone(&q.notify))
                .ok_or_else(|| TransportError::NotFound(format!("queue '{}'", queue)))
        })?;

        let prefetch = self.prefetch.load(Ordering::SeqCst);
        let permits = match prefetch {
            0 => Semaphore::MAX_PERMITS,
            n => usize::from(n),
        };
        debug!(queue = %queue, consumer_tag = %consumer_tag, prefetch, "Consumer registered");

        let (cancelled, cancelled_rx) = watch::channel(false);
        if let Some(previous) = lock(&self.consumers).insert(consumer_tag.to_string(), cancelled) {
            previous.send_replace(true);
        }

        let cursor = Cursor {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
            notify,
            permits: Arc::new(Semaphore::new(permits)),
            closed: self.closed.subscribe(),
            cancelled: cancelled_rx,
        };

        Ok(stream::unfold(cursor, |mut cursor| async move {
            let delivery = cursor.next_delivery().await?;
            Some((Ok::<_, TransportError>(delivery), cursor))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> TransportResult<()> {
        self.ensure_open()?;
        if let Some(cancelled) = lock(&self.consumers).remove(consumer_tag) {
            cancelled.send_replace(true);
            debug!(consumer_tag = %consumer_tag, "Consumer cancelled");
        }
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.send_replace(true);
        lock(&self.consumers).clear();
        Ok(())
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// Pull side of one consumer registration.
struct Cursor {
    shared: Arc<Shared>,
    queue: String,
    notify: Arc<Notify>,
    permits: Arc<Semaphore>,
    closed: watch::Receiver<bool>,
    cancelled: watch::Receiver<bool>,
}

impl Cursor {
    /// Wait for a prefetch slot and a ready message. `None` once the channel
    /// closes, the registration is cancelled or the queue disappears.
    ///
    /// Messages are only taken from the queue when pulled, so a cancelled
    /// cursor leaves everything it has not yielded in the queue.
    async fn next_delivery(&mut self) -> Option<InboundDelivery> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok()?,
            _ = wait_closed(&mut self.closed) => return None,
            _ = wait_closed(&mut self.cancelled) => return None,
        };

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if *self.closed.borrow() || *self.cancelled.borrow() {
                return None;
            }

            {
                let mut state = self.shared.state();
                let queue = state.queues.get_mut(&self.queue)?;
                if let Some(message) = queue.ready.pop_front() {
                    queue.unacked += 1;
                    return Some(self.delivery(message, permit));
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = wait_closed(&mut self.closed) => return None,
                _ = wait_closed(&mut self.cancelled) => return None,
            }
        }
    }

    fn delivery(&self, message: Message, permit: OwnedSemaphorePermit) -> InboundDelivery {
        InboundDelivery {
            body: message.payload.body.clone(),
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            headers: message.payload.headers.clone(),
            redelivered: message.redelivered,
            acker: Box::new(MemoryAcker {
                shared: Arc::clone(&self.shared),
                queue: self.queue.clone(),
                pending: Mutex::new(Some((message, permit))),
            }),
        }
    }
}

enum Settlement {
    Ack,
    Requeue,
    DeadLetter,
}

/// Settles one in-memory delivery. Dropping it unsettled requeues the message.
struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    pending: Mutex<Option<(Message, OwnedSemaphorePermit)>>,
}

impl MemoryAcker {
    fn settle(&self, settlement: Settlement) -> TransportResult<()> {
        let (message, permit) = lock(&self.pending).take().ok_or_else(|| {
            TransportError::Protocol("delivery already settled".to_string())
        })?;

        let expiries = {
            let mut state = self.shared.state();
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                queue.unacked = queue.unacked.saturating_sub(1);
            }
            match settlement {
                Settlement::Ack => Vec::new(),
                Settlement::Requeue => {
                    state.requeue(&self.queue, message);
                    Vec::new()
                }
                Settlement::DeadLetter => state.dead_letter(&self.queue, message, "rejected"),
            }
        };
        drop(permit);

        schedule_expiries(&self.shared, expiries);
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> TransportResult<()> {
        self.settle(Settlement::Ack)
    }

    async fn nack(&self, requeue: bool) -> TransportResult<()> {
        if requeue {
            self.settle(Settlement::Requeue)
        } else {
            self.settle(Settlement::DeadLetter)
        }
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if lock(&self.pending).is_some() {
            let _ = self.settle(Settlement::Requeue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::death_count;
    use futures::StreamExt;

    async fn setup() -> (InMemoryBroker, Arc<dyn BrokerChannel>) {
        let broker = InMemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        channel
            .declare_exchange("events", ExchangeKind::Topic, true)
            .await
            .unwrap();
        channel
            .declare_exchange("dlx", ExchangeKind::Topic, true)
            .await
            .unwrap();
        channel
            .declare_queue(&QueueSpec::durable("dlq"))
            .await
            .unwrap();
        channel.bind_queue("dlq", "dlx", "#").await.unwrap();
        channel
            .declare_queue(&QueueSpec::durable("work").with_dead_letter_exchange("dlx"))
            .await
            .unwrap();
        channel.bind_queue("work", "events", "game.*").await.unwrap();
        (broker, channel)
    }

    fn message(body: &str) -> OutboundMessage {
        OutboundMessage::json(body.as_bytes().to_vec())
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("game.comprado", "game.comprado"));
        assert!(topic_matches("game.*", "game.comprado"));
        assert!(!topic_matches("game.*", "game.comprado.event"));
        assert!(topic_matches("game.#", "game.comprado.event"));
        assert!(topic_matches("game.#", "game"));
        assert!(topic_matches("#", "usuario.ativado"));
        assert!(topic_matches("*.ativado", "usuario.ativado"));
        assert!(!topic_matches("*.ativado", "ativado"));
        assert!(topic_matches("#.ativado", "a.b.ativado"));
        assert!(!topic_matches("pedido.finalizado", "pedido.cancelado"));
    }

    #[tokio::test]
    async fn test_publish_routes_to_matching_queues_only() {
        let (broker, channel) = setup().await;

        channel
            .publish("events", "game.comprado", message("1"))
            .await
            .unwrap();
        channel
            .publish("events", "usuario.ativado", message("2"))
            .await
            .unwrap();

        let queued = broker.messages("work");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].text(), "1");
        assert_eq!(queued[0].routing_key, "game.comprado");
        assert!(queued[0].persistent);
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        let (broker, channel) = setup().await;

        channel.publish("", "work", message("direct")).await.unwrap();
        channel.publish("", "missing", message("lost")).await.unwrap();

        assert_eq!(broker.message_count("work"), 1);
    }

    #[tokio::test]
    async fn test_publish_to_unknown_exchange_fails() {
        let (_broker, channel) = setup().await;
        let result = channel.publish("nope", "x", message("x")).await;
        assert!(matches!(result, Err(TransportError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_inequivalent_redeclare_fails() {
        let (_broker, channel) = setup().await;

        let exchange = channel
            .declare_exchange("events", ExchangeKind::Direct, true)
            .await;
        assert!(matches!(exchange, Err(TransportError::PreconditionFailed(_))));

        let queue = channel.declare_queue(&QueueSpec::durable("work")).await;
        assert!(matches!(queue, Err(TransportError::PreconditionFailed(_))));

        // Equal re-declare is fine.
        channel
            .declare_queue(&QueueSpec::durable("work").with_dead_letter_exchange("dlx"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_requires_existing_queue_and_exchange() {
        let (_broker, channel) = setup().await;
        assert!(matches!(
            channel.bind_queue("ghost", "events", "#").await,
            Err(TransportError::NotFound(_))
        ));
        assert!(matches!(
            channel.bind_queue("work", "ghost", "#").await,
            Err(TransportError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ack_removes_message() {
        let (broker, channel) = setup().await;
        channel
            .publish("events", "game.comprado", message("1"))
            .await
            .unwrap();

        let mut deliveries = channel.consume("work", "t").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(broker.unacked_count("work"), 1);

        delivery.acker.ack().await.unwrap();

        assert_eq!(broker.message_count("work"), 0);
        assert_eq!(broker.unacked_count("work"), 0);
        assert_eq!(broker.message_count("dlq"), 0);
    }

    #[tokio::test]
    async fn test_double_settle_is_rejected() {
        let (_broker, channel) = setup().await;
        channel
            .publish("events", "game.comprado", message("1"))
            .await
            .unwrap();

        let mut deliveries = channel.consume("work", "t").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        delivery.acker.ack().await.unwrap();

        assert!(matches!(
            delivery.acker.nack(false).await,
            Err(TransportError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters_with_death_header() {
        let (broker, channel) = setup().await;
        channel
            .publish("events", "game.comprado", message("1"))
            .await
            .unwrap();

        let mut deliveries = channel.consume("work", "t").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        delivery.acker.nack(false).await.unwrap();

        assert_eq!(broker.message_count("work"), 0);
        let dead = broker.messages("dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].routing_key, "game.comprado");
        assert_eq!(dead[0].exchange, "dlx");
        assert_eq!(death_count(&dead[0].headers), 1);

        let Some(HeaderValue::List(deaths)) = dead[0].headers.get(DEATH_HEADER) else {
            panic!("missing x-death header");
        };
        let HeaderValue::Table(entry) = &deaths[0] else {
            panic!("x-death entry is not a table");
        };
        assert_eq!(entry.get("queue"), Some(&HeaderValue::Str("work".to_string())));
        assert_eq!(entry.get("reason"), Some(&HeaderValue::Str("rejected".to_string())));
        assert_eq!(entry.get("exchange"), Some(&HeaderValue::Str("events".to_string())));
    }

    #[tokio::test]
    async fn test_nack_with_requeue_redelivers() {
        let (broker, channel) = setup().await;
        channel
            .publish("events", "game.comprado", message("1"))
            .await
            .unwrap();

        let mut deliveries = channel.consume("work", "t").await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        first.acker.nack(true).await.unwrap();

        let second = deliveries.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        second.acker.ack().await.unwrap();
        assert_eq!(broker.message_count("dlq"), 0);
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_requeued() {
        let (broker, channel) = setup().await;
        channel
            .publish("events", "game.comprado", message("1"))
            .await
            .unwrap();

        let mut deliveries = channel.consume("work", "t").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        drop(delivery);

        assert_eq!(broker.message_count("work"), 1);
        assert!(broker.messages("work")[0].redelivered);
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked_deliveries() {
        let (broker, channel) = setup().await;
        for i in 0..3 {
            channel
                .publish("events", "game.comprado", message(&i.to_string()))
                .await
                .unwrap();
        }
        channel.set_prefetch(1).await.unwrap();

        let mut deliveries = channel.consume("work", "t").await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();

        // Second pull blocks until the first is settled.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), deliveries.next()).await;
        assert!(blocked.is_err());
        assert_eq!(broker.unacked_count("work"), 1);

        first.acker.ack().await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"1".to_vec());
    }

    #[tokio::test]
    async fn test_consumer_waits_for_messages_published_later() {
        let (_broker, channel) = setup().await;
        let mut deliveries = channel.consume("work", "t").await.unwrap();

        let publisher = Arc::clone(&channel);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher
                .publish("events", "game.comprado", message("late"))
                .await
                .unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(1), deliveries.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body, b"late".to_vec());
    }

    #[tokio::test]
    async fn test_close_ends_delivery_stream() {
        let (_broker, channel) = setup().await;
        let mut deliveries = channel.consume("work", "t").await.unwrap();

        channel.close().await.unwrap();
        channel.close().await.unwrap();

        assert!(deliveries.next().await.is_none());
        assert!(matches!(
            channel.publish("events", "game.comprado", message("x")).await,
            Err(TransportError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_ends_stream_and_leaves_messages_queued() {
        let (broker, channel) = setup().await;
        let mut cancelled = channel.consume("work", "old").await.unwrap();
        let mut other = channel.consume("work", "other").await.unwrap();

        channel.cancel("old").await.unwrap();
        channel.cancel("old").await.unwrap();
        assert!(cancelled.next().await.is_none());

        channel
            .publish("events", "game.comprado", message("after-cancel"))
            .await
            .unwrap();
        let delivery = other.next().await.unwrap().unwrap();
        assert_eq!(delivery.body, b"after-cancel".to_vec());
        delivery.acker.ack().await.unwrap();
        assert_eq!(broker.message_count("work"), 0);
    }

    #[tokio::test]
    async fn test_unavailable_broker_rejects_operations() {
        let (broker, channel) = setup().await;
        broker.set_available(false);

        assert!(broker.open_channel().await.is_err());
        assert!(matches!(
            channel.publish("events", "game.comprado", message("x")).await,
            Err(TransportError::Unavailable(_))
        ));

        broker.set_available(true);
        channel
            .publish("events", "game.comprado", message("x"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fail_next_publishes() {
        let (broker, channel) = setup().await;
        broker.fail_next_publishes(2);

        for _ in 0..2 {
            assert!(channel
                .publish("events", "game.comprado", message("x"))
                .await
                .is_err());
        }
        channel
            .publish("events", "game.comprado", message("x"))
            .await
            .unwrap();
        assert_eq!(broker.message_count("work"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_messages_are_dead_lettered() {
        let (broker, channel) = setup().await;
        channel
            .declare_queue(
                &QueueSpec::durable("short-lived")
                    .with_dead_letter_exchange("dlx")
                    .with_message_ttl(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        channel.publish("", "short-lived", message("x")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(broker.message_count("short-lived"), 0);
        let dead = broker.messages("dlq");
        assert_eq!(dead.len(), 1);
        let Some(HeaderValue::List(deaths)) = dead[0].headers.get(DEATH_HEADER) else {
            panic!("missing x-death header");
        };
        let HeaderValue::Table(entry) = &deaths[0] else {
            panic!("x-death entry is not a table");
        };
        assert_eq!(entry.get("reason"), Some(&HeaderValue::Str("expired".to_string())));
    }
}
