// The messaging-client boundary the cache consumes. A `Connector` turns a
// connection descriptor into a live `EventClient`; the client enumerates
// partitions and opens one `Subscription` per partition. Delivery happens on
// the client's own tasks through the callbacks handed to `receive`.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::descriptor::ConnectionDescriptor;
use crate::error::TelemetryError;
use crate::telemetry::EventMessage;

/// Called for every message delivered on a partition.
pub type MessageHandler = Arc<dyn Fn(EventMessage) + Send + Sync>;

/// Called when a partition's receive stream reports an error.
pub type ErrorHandler = Arc<dyn Fn(TelemetryError) + Send + Sync>;

/// Where a new subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPosition {
    /// Everything the source still holds for the partition.
    Earliest,
    /// Only events arriving after the subscription is opened.
    Latest,
    /// Only events enqueued at or after the given time.
    FromEnqueuedTime(DateTime<Utc>),
}

impl EventPosition {
    /// Whether an event enqueued at `enqueued` falls inside this position.
    /// `Latest` admits everything that is delivered live.
    pub fn admits(&self, enqueued: DateTime<Utc>) -> bool {
        match self {
            EventPosition::FromEnqueuedTime(start) => enqueued >= *start,
            EventPosition::Earliest | EventPosition::Latest => true,
        }
    }

    /// Whether backlog held by the source from before the subscription
    /// should be replayed.
    pub fn replays_backlog(&self) -> bool {
        matches!(self, EventPosition::Earliest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    pub position: EventPosition,
}

impl ReceiveOptions {
    /// Only events enqueued from now on; no replay of historical backlog.
    pub fn from_now() -> Self {
        ReceiveOptions {
            position: EventPosition::FromEnqueuedTime(Utc::now()),
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Client: EventClient;

    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Self::Client, TelemetryError>;
}

#[async_trait]
pub trait EventClient: Send + Sync + 'static {
    async fn partition_ids(&self) -> Result<Vec<String>, TelemetryError>;

    async fn receive(
        &self,
        partition_id: &str,
        on_message: MessageHandler,
        on_error: ErrorHandler,
        options: ReceiveOptions,
    ) -> Result<Box<dyn Subscription>, TelemetryError>;

    /// Release the underlying connection. Open subscriptions stop delivering.
    async fn close(&self) -> Result<(), TelemetryError>;
}

/// An open receive stream against one partition.
#[async_trait]
pub trait Subscription: Send + Sync {
    fn partition_id(&self) -> &str;

    async fn close(self: Box<Self>) -> Result<(), TelemetryError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_position_admits() {
        let start = Utc::now();
        let pos = EventPosition::FromEnqueuedTime(start);
        assert!(pos.admits(start));
        assert!(pos.admits(start + Duration::seconds(1)));
        assert!(!pos.admits(start - Duration::seconds(1)));
        assert!(EventPosition::Earliest.admits(start - Duration::days(1)));
    }

    #[test]
    fn test_only_earliest_replays_backlog() {
        assert!(EventPosition::Earliest.replays_backlog());
        assert!(!EventPosition::Latest.replays_backlog());
        assert!(!ReceiveOptions::from_now().position.replays_backlog());
    }
}
