//! Courier - reliable domain-event dispatch.
//!
//! Producers publish [`event::EventEnvelope`]s through an [`bus::EventBus`]:
//! the in-process bus fans out to local handlers, the broker bus ships
//! events to a topic exchange. Broker consumers ack on success and
//! dead-letter on failure; [`resilience::ResilientEventBus`] adds timeout,
//! circuit breaking and retry around any bus.

pub mod broker;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod event;
pub mod resilience;
pub mod utils;
