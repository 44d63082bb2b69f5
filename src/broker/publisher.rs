//! Broker publisher.
//!
//! `BrokerEventBus` is a write-only [`EventBus`]: events are serialized as
//! JSON and published to the topic exchange under their routing key.
//! Receiving happens through [`BrokerConsumer`](super::BrokerConsumer).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

#[cfg(feature = "otel")]
use crate::utils::metrics::{self, event_type_attr, outcome_attr, BUS_PUBLISH_TOTAL};

use super::{
    BrokerChannel, BrokerConnector, HeaderValue, OutboundMessage, Topology, EVENT_TYPE_HEADER,
    TIMESTAMP_HEADER,
};
use crate::bus::{BusError, EventBus, EventHandler, Result};
use crate::event::{EventEnvelope, RoutingTable};

/// Publish-only event bus over a broker channel.
pub struct BrokerEventBus {
    channel: Arc<dyn BrokerChannel>,
    topology: Topology,
    routing: RoutingTable,
    closed: AtomicBool,
}

impl BrokerEventBus {
    /// Open a channel and declare the topology.
    ///
    /// Fails with [`BusError::Connection`] if the broker is unreachable or
    /// rejects a declaration.
    pub async fn connect(
        connector: &dyn BrokerConnector,
        topology: Topology,
        routing: RoutingTable,
    ) -> Result<Self> {
        let channel = connector.open_channel().await.map_err(BusError::Connection)?;

        if let Err(e) = topology.declare(channel.as_ref()).await {
            error!(error = %e, exchange = %topology.exchange, "Failed to declare topology");
            let _ = channel.close().await;
            return Err(BusError::Connection(e));
        }

        info!(
            exchange = %topology.exchange,
            dead_letter_exchange = %topology.dead_letter_exchange,
            dead_letter_queue = %topology.dead_letter_queue,
            "Broker publisher connected"
        );

        Ok(Self {
            channel,
            topology,
            routing,
            closed: AtomicBool::new(false),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// Close the underlying channel. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.channel.close().await.map_err(BusError::Connection)?;
        info!(exchange = %self.topology.exchange, "Broker publisher closed");
        Ok(())
    }
}

#[async_trait]
impl EventBus for BrokerEventBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(event_type = %event.event_type()))]
    async fn publish(&self, event: EventEnvelope) -> Result<()> {
        event.validate()?;
        let event_type = event.event_type();

        let routing_key = self.routing.routing_key(event_type);
        if routing_key.is_empty() {
            return Err(BusError::InvalidArgument(format!(
                "event type '{}' derives an empty routing key",
                event_type
            )));
        }

        let message = OutboundMessage::json(event.to_json()?)
            .with_header(EVENT_TYPE_HEADER, HeaderValue::Str(event_type.to_string()))
            .with_header(
                TIMESTAMP_HEADER,
                HeaderValue::Int(chrono::Utc::now().timestamp_millis()),
            );

        let result = self
            .channel
            .publish(&self.topology.exchange, &routing_key, message)
            .await;

        #[cfg(feature = "otel")]
        BUS_PUBLISH_TOTAL.add(
            1,
            &[
                event_type_attr(event_type),
                outcome_attr(metrics::outcome(result.is_ok())),
            ],
        );

        match result {
            Ok(()) => {
                debug!(
                    exchange = %self.topology.exchange,
                    routing_key = %routing_key,
                    "Event published"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    exchange = %self.topology.exchange,
                    routing_key = %routing_key,
                    error = %e,
                    "Failed to publish event"
                );
                Err(BusError::Publish(e))
            }
        }
    }

    async fn subscribe(&self, _event_type: &str, _handler: Arc<dyn EventHandler>) -> Result<()> {
        Err(BusError::Unsupported(
            "broker bus is publish-only, consume with BrokerConsumer",
        ))
    }

    async fn unsubscribe(&self, _event_type: &str, _handler: &Arc<dyn EventHandler>) -> Result<()> {
        Err(BusError::Unsupported(
            "broker bus is publish-only, consume with BrokerConsumer",
        ))
    }

    async fn handler_count(&self, _event_type: &str) -> Result<usize> {
        Err(BusError::Unsupported(
            "broker bus does not track handlers",
        ))
    }
}
