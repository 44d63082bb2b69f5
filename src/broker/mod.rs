//! Broker-backed messaging.
//!
//! This module contains:
//! - The transport seam: `BrokerConnector`, `BrokerChannel`, `Acker`
//! - `BrokerEventBus`: publish-only `EventBus` over a broker
//! - `BrokerConsumer`: queue consumer that acks on success and dead-letters on failure
//! - `Topology`: exchange / dead-letter wiring shared by both sides
//!
//! Transports:
//! - `amqp`: RabbitMQ via lapin (feature `amqp`)
//! - `memory`: in-process broker with the same routing and dead-letter rules

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod consumer;
pub mod memory;
pub mod publisher;
pub mod topology;

pub use consumer::{BrokerConsumer, ConsumedMessage, MessageHandler, DEFAULT_PREFETCH};
pub use memory::InMemoryBroker;
pub use publisher::BrokerEventBus;
pub use topology::Topology;

/// Header carrying the event type name.
pub const EVENT_TYPE_HEADER: &str = "x-event-type";

/// Header carrying the publish time in unix milliseconds.
pub const TIMESTAMP_HEADER: &str = "x-timestamp";

/// Header the broker attaches to dead-lettered messages.
pub const DEATH_HEADER: &str = "x-death";

/// Content type of every published event body.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Errors raised by a broker transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Publish not confirmed by broker")]
    Nacked,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Exchange routing semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Dot-separated keys matched against `*` / `#` patterns.
    Topic,
    /// Exact routing key match.
    Direct,
}

/// Header value as carried in message headers and queue arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<HeaderValue>),
    Table(Headers),
}

/// Message headers.
pub type Headers = BTreeMap<String, HeaderValue>;

/// Total number of times a message was dead-lettered, from its `x-death` header.
pub fn death_count(headers: &Headers) -> i64 {
    let Some(HeaderValue::List(deaths)) = headers.get(DEATH_HEADER) else {
        return 0;
    };
    deaths
        .iter()
        .filter_map(|death| match death {
            HeaderValue::Table(entry) => match entry.get("count") {
                Some(HeaderValue::Int(count)) => Some(*count),
                _ => None,
            },
            _ => None,
        })
        .sum()
}

/// Queue declaration.
///
/// Two declarations of the same queue must be equal; brokers reject an
/// inequivalent re-declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Exchange that receives rejected and expired messages.
    pub dead_letter_exchange: Option<String>,
    /// Routing key used when dead-lettering. Defaults to the message's own key.
    pub dead_letter_routing_key: Option<String>,
    /// Per-message time to live.
    pub message_ttl: Option<Duration>,
}

impl QueueSpec {
    /// A durable queue with no extra arguments.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            message_ttl: None,
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn with_dead_letter_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }
}

/// Message handed to a channel for publishing.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub content_type: Option<String>,
    /// Survive broker restarts (delivery mode 2).
    pub persistent: bool,
}

impl OutboundMessage {
    /// Persistent JSON message.
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            body,
            headers: Headers::new(),
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            persistent: true,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: HeaderValue) -> Self {
        self.headers.insert(name.into(), value);
        self
    }
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Positive acknowledgment; the broker forgets the message.
    async fn ack(&self) -> TransportResult<()>;

    /// Negative acknowledgment. Without requeue the message is dead-lettered
    /// (or dropped when its queue has no dead-letter exchange).
    async fn nack(&self, requeue: bool) -> TransportResult<()>;
}

/// A message received from a queue, not yet settled.
pub struct InboundDelivery {
    pub body: Vec<u8>,
    pub exchange: String,
    pub routing_key: String,
    pub headers: Headers,
    pub redelivered: bool,
    pub acker: Box<dyn Acker>,
}

impl InboundDelivery {
    /// String header value, if present.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        match self.headers.get(name) {
            Some(HeaderValue::Str(value)) => Some(value),
            _ => None,
        }
    }
}

impl std::fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries for one consumer registration.
pub type DeliveryStream = BoxStream<'static, TransportResult<InboundDelivery>>;

/// One logical channel to a broker.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare an exchange. Idempotent for equal arguments.
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> TransportResult<()>;

    /// Declare a queue. Idempotent for equal specs.
    async fn declare_queue(&self, spec: &QueueSpec) -> TransportResult<()>;

    /// Bind a queue to an exchange with a routing pattern.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
        -> TransportResult<()>;

    /// Publish and wait for the broker's confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> TransportResult<()>;

    /// Limit unacknowledged deliveries for consumers registered afterwards.
    async fn set_prefetch(&self, count: u16) -> TransportResult<()>;

    /// Register a consumer on a queue.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> TransportResult<DeliveryStream>;

    /// Cancel a consumer registration. The broker stops pushing messages to
    /// the tag and its delivery stream ends once already-pushed deliveries
    /// have been yielded. Unknown tags are ignored.
    async fn cancel(&self, consumer_tag: &str) -> TransportResult<()>;

    /// Close the channel. Closing twice is a no-op.
    async fn close(&self) -> TransportResult<()>;
}

/// Opens channels to a broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn open_channel(&self) -> TransportResult<Arc<dyn BrokerChannel>>;
}
