//! courier-topology: declare broker topology ahead of deployment.
//!
//! Declares the primary exchange, the dead-letter exchange and queue, every
//! configured consumer queue with its bindings, and the retry queues of
//! consumers that set `retry_delay_ms`. Every declaration is idempotent, so
//! the tool can run on each release.
//!
//! ## Usage
//! ```text
//! courier-topology [CONFIG_PATH]
//! ```
//! Configuration is layered as described on `Config::load`; logging is
//! controlled by `COURIER_LOG`.

use std::time::Duration;

use tracing::info;

use courier::broker::amqp::AmqpConnector;
use courier::broker::BrokerConnector;
use courier::config::{Config, MessagingType};
use courier::utils::bootstrap::{connect_with_retry, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;

    if config.messaging.messaging_type != MessagingType::Amqp {
        return Err("courier-topology requires messaging.type = amqp".into());
    }

    let amqp = &config.messaging.amqp;
    info!(url = %amqp.redacted_url(), "starting courier-topology");

    let connector = AmqpConnector::new(amqp)?;
    let connector = &connector;
    let channel =
        connect_with_retry(&amqp.redacted_url(), move || connector.open_channel()).await?;

    let topology = config.messaging.topology.to_topology();
    topology.declare(channel.as_ref()).await?;

    for consumer in &config.messaging.consumers {
        topology
            .declare_consumer_queue(channel.as_ref(), &consumer.queue, &consumer.bindings)
            .await?;

        if let Some(delay_ms) = consumer.retry_delay_ms {
            topology
                .declare_retry_queue(
                    channel.as_ref(),
                    &consumer.queue,
                    Duration::from_millis(delay_ms),
                )
                .await?;
        }
    }

    channel.close().await?;
    info!(
        exchange = %topology.exchange,
        consumers = config.messaging.consumers.len(),
        "Topology declared"
    );
    Ok(())
}
