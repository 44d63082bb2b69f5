//! Process-level helpers shared by the library and the topology binary.

pub mod bootstrap;
#[cfg(feature = "otel")]
pub mod metrics;
