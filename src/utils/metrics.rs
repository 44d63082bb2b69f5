//! OTel-native metrics instruments.
//!
//! All instruments are lazily initialized and feature-gated behind `otel`.
//! Naming follows OTel semantic conventions (dot-separated).

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{global, KeyValue};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("courier"));

// ============================================================================
// Event Bus
// ============================================================================

/// Total broker publish operations.
pub static BUS_PUBLISH_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("courier.bus.publish.total")
        .with_description("Total broker publish operations")
        .build()
});

// ============================================================================
// Consumer
// ============================================================================

/// Total deliveries settled by broker consumers.
pub static CONSUMER_MESSAGE_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("courier.consumer.message.total")
        .with_description("Total deliveries settled by consumers")
        .build()
});

// ============================================================================
// Resilience
// ============================================================================

/// Total publish retries scheduled by the resilience decorator.
pub static RETRY_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("courier.resilience.retry.total")
        .with_description("Total publish retries")
        .build()
});

/// Total circuit breaker rejections.
pub static CIRCUIT_REJECTED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("courier.resilience.circuit_rejected.total")
        .with_description("Calls rejected by an open circuit")
        .build()
});

// ============================================================================
// Helper
// ============================================================================

/// `"success"` or `"error"`.
pub fn outcome(ok: bool) -> &'static str {
    if ok {
        "success"
    } else {
        "error"
    }
}

/// Create an outcome label.
pub fn outcome_attr(outcome: &str) -> KeyValue {
    KeyValue::new("outcome", outcome.to_string())
}

/// Create an event_type label.
pub fn event_type_attr(event_type: &str) -> KeyValue {
    KeyValue::new("event_type", event_type.to_string())
}

/// Create a queue label.
pub fn queue_attr(queue: &str) -> KeyValue {
    KeyValue::new("queue", queue.to_string())
}
