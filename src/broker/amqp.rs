//! AMQP (RabbitMQ) transport.
//!
//! Connections come from a `deadpool-lapin` pool. Each channel is opened in
//! publisher-confirm mode so `publish` only returns once the broker has taken
//! responsibility for the message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{
    Acker, BrokerChannel, BrokerConnector, DeliveryStream, ExchangeKind, HeaderValue, Headers,
    InboundDelivery, OutboundMessage, QueueSpec, TransportError, TransportResult,
};
use crate::bus::{BusError, Result};
use crate::config::AmqpConfig;

impl From<lapin::Error> for TransportError {
    fn from(e: lapin::Error) -> Self {
        match e {
            lapin::Error::ProtocolError(_) => TransportError::Protocol(e.to_string()),
            other => TransportError::Unavailable(other.to_string()),
        }
    }
}

impl From<PoolError> for TransportError {
    fn from(e: PoolError) -> Self {
        TransportError::Unavailable(format!("Failed to get connection from pool: {}", e))
    }
}

// ============================================================================
// Header conversion
// ============================================================================

fn to_amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Str(s) => AMQPValue::LongString(LongString::from(s.as_str())),
        HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
        HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        HeaderValue::List(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(to_amqp_value).collect::<Vec<_>>()))
        }
        HeaderValue::Table(fields) => AMQPValue::FieldTable(to_field_table(fields)),
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in headers {
        table.insert(ShortString::from(name.as_str()), to_amqp_value(value));
    }
    table
}

fn from_amqp_value(value: &AMQPValue) -> Option<HeaderValue> {
    let converted = match value {
        AMQPValue::LongString(s) => {
            HeaderValue::Str(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        AMQPValue::ShortString(s) => HeaderValue::Str(s.as_str().to_string()),
        AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
        AMQPValue::ShortShortInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::ShortShortUInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::ShortInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::ShortUInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::LongInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::LongUInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::LongLongInt(i) => HeaderValue::Int(*i),
        AMQPValue::Timestamp(t) => HeaderValue::Int(*t as i64),
        AMQPValue::FieldArray(items) => HeaderValue::List(
            items
                .as_slice()
                .iter()
                .filter_map(from_amqp_value)
                .collect(),
        ),
        AMQPValue::FieldTable(table) => HeaderValue::Table(from_field_table(table)),
        _ => return None,
    };
    Some(converted)
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(name, value)| {
            from_amqp_value(value).map(|v| (name.as_str().to_string(), v))
        })
        .collect()
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(exchange) = &spec.dead_letter_exchange {
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.as_str().into()),
        );
    }
    if let Some(routing_key) = &spec.dead_letter_routing_key {
        arguments.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(routing_key.as_str().into()),
        );
    }
    if let Some(ttl) = spec.message_ttl {
        let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        arguments.insert("x-message-ttl".into(), AMQPValue::LongLongInt(millis));
    }
    arguments
}

// ============================================================================
// Connector
// ============================================================================

/// Opens confirm-mode channels from a pooled AMQP connection.
#[derive(Clone)]
pub struct AmqpConnector {
    pool: Pool,
    automatic_recovery: bool,
}

impl AmqpConnector {
    /// Build the connection pool. No connection is made until the first
    /// channel is opened.
    pub fn new(config: &AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size.max(1))
            .build()
            .map_err(|e| {
                BusError::Connection(TransportError::Unavailable(format!(
                    "Failed to create pool: {}",
                    e
                )))
            })?;

        info!(url = %config.redacted_url(), pool_size = config.pool_size, "AMQP pool created");

        Ok(Self {
            pool,
            automatic_recovery: config.automatic_recovery,
        })
    }
}

async fn open_confirm_channel(pool: &Pool) -> TransportResult<Channel> {
    let connection = pool.get().await?;
    let channel = connection.create_channel().await?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await?;
    Ok(channel)
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn open_channel(&self) -> TransportResult<Arc<dyn BrokerChannel>> {
        let channel = open_confirm_channel(&self.pool).await?;
        debug!(channel_id = channel.id(), "AMQP channel opened");

        Ok(Arc::new(AmqpChannel {
            pool: self.pool.clone(),
            channel: RwLock::new(channel),
            automatic_recovery: self.automatic_recovery,
            closed: AtomicBool::new(false),
        }))
    }
}

// ============================================================================
// Channel
// ============================================================================

/// A lapin channel that is reopened on next use after the broker closed it,
/// when automatic recovery is enabled.
pub struct AmqpChannel {
    pool: Pool,
    channel: RwLock<Channel>,
    automatic_recovery: bool,
    closed: AtomicBool,
}

impl AmqpChannel {
    async fn current(&self) -> TransportResult<Channel> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("channel is closed".to_string()));
        }

        let channel = self.channel.read().await.clone();
        if channel.status().connected() || !self.automatic_recovery {
            return Ok(channel);
        }

        let mut guard = self.channel.write().await;
        if !guard.status().connected() {
            warn!("AMQP channel closed by broker, reopening");
            *guard = open_confirm_channel(&self.pool).await?;
        }
        Ok(guard.clone())
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> TransportResult<()> {
        let kind = match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        };
        self.current()
            .await?
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> TransportResult<()> {
        self.current()
            .await?
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                queue_arguments(spec),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()> {
        self.current()
            .await?
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> TransportResult<()> {
        let mut properties = BasicProperties::default();
        if message.persistent {
            properties = properties.with_delivery_mode(2);
        }
        if let Some(content_type) = &message.content_type {
            properties = properties.with_content_type(content_type.as_str().into());
        }
        if !message.headers.is_empty() {
            properties = properties.with_headers(to_field_table(&message.headers));
        }

        let confirmation = self
            .current()
            .await?
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(TransportError::Nacked);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> TransportResult<()> {
        self.current()
            .await?
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> TransportResult<DeliveryStream> {
        let consumer = self
            .current()
            .await?
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| {
                let delivery = delivery?;
                let headers = delivery
                    .properties
                    .headers()
                    .as_ref()
                    .map(from_field_table)
                    .unwrap_or_default();

                Ok(InboundDelivery {
                    body: delivery.data,
                    exchange: delivery.exchange.as_str().to_string(),
                    routing_key: delivery.routing_key.as_str().to_string(),
                    headers,
                    redelivered: delivery.redelivered,
                    acker: Box::new(AmqpAcker(delivery.acker)),
                })
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> TransportResult<()> {
        // A reopened channel never saw the tag.
        let channel = self.channel.read().await.clone();
        if !channel.status().connected() {
            return Ok(());
        }
        channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        debug!(consumer_tag = %consumer_tag, "Consumer cancelled");
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let channel = self.channel.read().await.clone();
        if channel.status().connected() {
            channel.close(200, "closing").await?;
        }
        Ok(())
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> TransportResult<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> TransportResult<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}
