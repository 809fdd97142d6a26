// Error taxonomy for the telemetry cache. Connect and enumeration failures
// end a `start()` attempt; receive failures belong to a single partition.
// Neither is surfaced to readers of the cached snapshot.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid connection string: {0}")]
    InvalidDescriptor(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("receive failed on partition '{partition}': {message}")]
    Receive { partition: String, message: String },

    #[error("client closed")]
    Closed,
}

impl TelemetryError {
    pub fn receive(partition: impl Into<String>, message: impl std::fmt::Display) -> Self {
        TelemetryError::Receive {
            partition: partition.into(),
            message: message.to_string(),
        }
    }

    /// Partition the error belongs to, if it is a receive error.
    pub fn partition(&self) -> Option<&str> {
        match self {
            TelemetryError::Receive { partition, .. } => Some(partition),
            _ => None,
        }
    }
}
