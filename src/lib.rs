//! Latest-value telemetry cache fed by a multi-partition message source.
//!
//! [`receiver::LatestTelemetryCache`] subscribes to every partition exposed
//! by an injected [`source::Connector`] and keeps the most recently delivered
//! message body for polling. [`mqtt::MqttConnector`] is the bundled
//! connector; `server` wraps the cache in a small HTTP service.
pub mod config;
pub mod descriptor;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod mqtt;
pub mod receiver;
pub mod server;
pub mod source;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use descriptor::ConnectionDescriptor;
pub use error::TelemetryError;
pub use receiver::{LatestTelemetryCache, PartitionState, TelemetryReader};
pub use telemetry::{EventMessage, TelemetrySnapshot};
