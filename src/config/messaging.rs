//! Messaging and event bus configuration types.

use serde::Deserialize;

use super::ConfigError;
use crate::broker::topology::{
    DEFAULT_DEAD_LETTER_EXCHANGE, DEFAULT_DEAD_LETTER_QUEUE, DEFAULT_EXCHANGE,
};
use crate::broker::{Topology, DEFAULT_PREFETCH};
use crate::event::RoutingTable;

/// Messaging type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagingType {
    /// In-process fan-out (no external broker).
    #[default]
    InProcess,
    /// AMQP/RabbitMQ messaging.
    Amqp,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// AMQP-specific configuration.
    pub amqp: AmqpConfig,
    /// Exchange and dead-letter names.
    pub topology: TopologyConfig,
    /// Routing keys that replace the derived key for specific event types.
    pub routing_overrides: Vec<RoutingOverride>,
    /// Consumer queues to declare and consume.
    pub consumers: Vec<ConsumerConfig>,
}

impl MessagingConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        for consumer in &self.consumers {
            if consumer.queue.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "consumer queue name must not be empty".to_string(),
                ));
            }
            if consumer.prefetch == 0 {
                return Err(ConfigError::Invalid(format!(
                    "consumer '{}' prefetch must be at least 1",
                    consumer.queue
                )));
            }
        }
        for route in &self.routing_overrides {
            if route.event_type.is_empty() || route.routing_key.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "routing override '{}' -> '{}' has an empty side",
                    route.event_type, route.routing_key
                )));
            }
        }
        Ok(())
    }

    /// Routing table with the configured overrides.
    pub fn routing_table(&self) -> RoutingTable {
        RoutingTable::from_overrides(
            self.routing_overrides
                .iter()
                .map(|route| (route.event_type.clone(), route.routing_key.clone()))
                .collect(),
        )
    }
}

/// Fixed routing key for one event type.
///
/// A list rather than a map so event type names keep their case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RoutingOverride {
    pub event_type: String,
    pub routing_key: String,
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    /// Heartbeat interval negotiated with the broker.
    pub heartbeat_secs: u16,
    /// Reopen closed channels on next use.
    pub automatic_recovery: bool,
    /// Maximum pooled connections.
    pub pool_size: usize,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            heartbeat_secs: 10,
            automatic_recovery: true,
            pool_size: 10,
        }
    }
}

impl AmqpConfig {
    /// AMQP connection URL.
    pub fn url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost),
            self.heartbeat_secs
        )
    }

    /// Connection URL with the password masked, for logging.
    pub fn redacted_url(&self) -> String {
        format!(
            "amqp://{}:***@{}:{}/{}",
            urlencoding::encode(&self.username),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost)
        )
    }
}

/// Exchange and dead-letter names.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub exchange: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            dead_letter_exchange: DEFAULT_DEAD_LETTER_EXCHANGE.to_string(),
            dead_letter_queue: DEFAULT_DEAD_LETTER_QUEUE.to_string(),
        }
    }
}

impl TopologyConfig {
    pub fn to_topology(&self) -> Topology {
        Topology {
            exchange: self.exchange.clone(),
            dead_letter_exchange: self.dead_letter_exchange.clone(),
            dead_letter_queue: self.dead_letter_queue.clone(),
        }
    }
}

/// One consumer queue.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub queue: String,
    /// Routing patterns bound on the primary exchange.
    pub bindings: Vec<String>,
    pub prefetch: u16,
    /// When set, a `{queue}.retry` delay queue is declared in front of the queue.
    pub retry_delay_ms: Option<u64>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: String::new(),
            bindings: Vec::new(),
            prefetch: DEFAULT_PREFETCH,
            retry_delay_ms: None,
        }
    }
}
