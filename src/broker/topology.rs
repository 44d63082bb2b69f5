//! Exchange and dead-letter topology.
//!
//! ```text
//!   publisher ──► courier.events (topic) ──► consumer queue ──► handler
//!                                                   │ nack / expired
//!                                                   ▼
//!                      courier.dlx (topic) ──#──► courier.dlq
//! ```
//!
//! Every declaration is idempotent. Nothing here ever deletes an exchange or
//! queue.

use std::time::Duration;

use tracing::{debug, info};

use super::{BrokerChannel, ExchangeKind, QueueSpec, TransportResult};

/// Default primary exchange.
pub const DEFAULT_EXCHANGE: &str = "courier.events";

/// Default dead-letter exchange.
pub const DEFAULT_DEAD_LETTER_EXCHANGE: &str = "courier.dlx";

/// Default dead-letter queue.
pub const DEFAULT_DEAD_LETTER_QUEUE: &str = "courier.dlq";

/// Binding pattern matching every routing key.
pub const MATCH_ALL: &str = "#";

/// Routing key used to bind a retry queue to its exchange.
const RETRY_ROUTING_KEY: &str = "retry";

/// Names of the shared exchanges and the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            dead_letter_exchange: DEFAULT_DEAD_LETTER_EXCHANGE.to_string(),
            dead_letter_queue: DEFAULT_DEAD_LETTER_QUEUE.to_string(),
        }
    }
}

impl Topology {
    /// Declare the primary exchange, the dead-letter exchange and the
    /// dead-letter queue bound to it with `#`.
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> TransportResult<()> {
        channel
            .declare_exchange(&self.exchange, ExchangeKind::Topic, true)
            .await?;
        channel
            .declare_exchange(&self.dead_letter_exchange, ExchangeKind::Topic, true)
            .await?;
        channel
            .declare_queue(&QueueSpec::durable(&self.dead_letter_queue))
            .await?;
        channel
            .bind_queue(&self.dead_letter_queue, &self.dead_letter_exchange, MATCH_ALL)
            .await?;

        debug!(
            exchange = %self.exchange,
            dead_letter_exchange = %self.dead_letter_exchange,
            dead_letter_queue = %self.dead_letter_queue,
            "Topology declared"
        );
        Ok(())
    }

    /// Queue spec for a consumer queue that dead-letters into this topology.
    pub fn consumer_queue_spec(&self, queue: &str) -> QueueSpec {
        QueueSpec::durable(queue).with_dead_letter_exchange(&self.dead_letter_exchange)
    }

    /// Declare a durable consumer queue wired to the dead-letter exchange and
    /// bind it to the primary exchange with each pattern.
    pub async fn declare_consumer_queue(
        &self,
        channel: &dyn BrokerChannel,
        queue: &str,
        bindings: &[String],
    ) -> TransportResult<()> {
        channel.declare_queue(&self.consumer_queue_spec(queue)).await?;
        for pattern in bindings {
            channel.bind_queue(queue, &self.exchange, pattern).await?;
        }

        info!(
            queue = %queue,
            bindings = ?bindings,
            dead_letter_exchange = %self.dead_letter_exchange,
            "Consumer queue declared"
        );
        Ok(())
    }

    /// Declare a delay queue in front of `queue`.
    ///
    /// Messages published to the `{queue}.retry` exchange wait `delay` in the
    /// `{queue}.retry` queue, then expire back into `queue` through the
    /// default exchange. Returns the retry exchange name.
    pub async fn declare_retry_queue(
        &self,
        channel: &dyn BrokerChannel,
        queue: &str,
        delay: Duration,
    ) -> TransportResult<String> {
        let retry = retry_name(queue);

        channel
            .declare_exchange(&retry, ExchangeKind::Direct, true)
            .await?;
        channel
            .declare_queue(
                &QueueSpec::durable(&retry)
                    .with_dead_letter_exchange("")
                    .with_dead_letter_routing_key(queue)
                    .with_message_ttl(delay),
            )
            .await?;
        channel.bind_queue(&retry, &retry, RETRY_ROUTING_KEY).await?;

        info!(
            queue = %queue,
            retry_queue = %retry,
            delay_ms = delay.as_millis() as u64,
            "Retry queue declared"
        );
        Ok(retry)
    }
}

/// Name of the retry exchange and queue for a work queue.
pub fn retry_name(queue: &str) -> String {
    format!("{}.retry", queue)
}

/// Routing key to publish with on a retry exchange.
pub fn retry_routing_key() -> &'static str {
    RETRY_ROUTING_KEY
}
