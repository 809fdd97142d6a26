// Connection descriptor parsing. The descriptor is a single secret string of
// `Key=Value` pairs separated by `;`, e.g.
//
//   HostName=broker.local;Port=8883;Username=svc;Password=...;Topic=devices/telemetry;PartitionCount=4
//
// It should come from the environment (see `config`), never from source.
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::TelemetryError;

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_CLIENT_ID: &str = "iot_telemetry_cache";
pub const DEFAULT_KEEP_ALIVE_SECS: u16 = 5;

#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    pub topic: String,
    pub partition_count: u32,
    pub keep_alive: Duration,
}

impl ConnectionDescriptor {
    /// Topic carrying the events of one partition.
    pub fn partition_topic(&self, partition_id: &str) -> String {
        format!("{}/{}", self.topic.trim_end_matches('/'), partition_id)
    }

    pub fn partition_ids(&self) -> Vec<String> {
        (0..self.partition_count).map(|p| p.to_string()).collect()
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut host = None;
        let mut port = DEFAULT_PORT;
        let mut client_id = DEFAULT_CLIENT_ID.to_string();
        let mut user = None;
        let mut pass = None;
        let mut topic = None;
        let mut partition_count = 1u32;
        let mut keep_alive = DEFAULT_KEEP_ALIVE_SECS;

        for segment in s.split(';').map(str::trim).filter(|seg| !seg.is_empty()) {
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                TelemetryError::InvalidDescriptor(format!("expected Key=Value, got '{}'", segment))
            })?;
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "hostname" => host = Some(value.to_string()),
                "port" => port = parse_number("Port", value)?,
                "clientid" => client_id = value.to_string(),
                "username" => user = Some(value.to_string()),
                "password" => pass = Some(value.to_string()),
                "topic" => topic = Some(value.to_string()),
                "partitioncount" => partition_count = parse_number("PartitionCount", value)?,
                "keepalivesecs" => keep_alive = parse_number("KeepAliveSecs", value)?,
                other => tracing::warn!(key = other, "ignoring unknown connection string key"),
            }
        }

        let host = host
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TelemetryError::InvalidDescriptor("HostName must be set".into()))?;
        let topic = topic
            .filter(|t| !t.is_empty())
            .ok_or_else(|| TelemetryError::InvalidDescriptor("Topic must be set".into()))?;
        if partition_count == 0 {
            return Err(TelemetryError::InvalidDescriptor(
                "PartitionCount must be at least 1".into(),
            ));
        }

        let credentials = match (user, pass) {
            (Some(user), Some(pass)) => Some((user, pass)),
            (Some(_), None) | (None, Some(_)) => {
                // Warn but continue without credentials if only one is set.
                tracing::warn!(
                    "credentials incomplete: both Username and Password must be set to enable auth"
                );
                None
            }
            (None, None) => None,
        };

        Ok(ConnectionDescriptor {
            host,
            port,
            client_id,
            credentials,
            topic,
            partition_count,
            // MQTT carries keep-alive as a 16-bit number of seconds
            keep_alive: Duration::from_secs(u64::from(keep_alive)),
        })
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, TelemetryError>
where
    T::Err: fmt::Display,
{
    value.parse::<T>().map_err(|e| {
        TelemetryError::InvalidDescriptor(format!("invalid {} value '{}': {}", key, value, e))
    })
}

impl fmt::Debug for ConnectionDescriptor {
    // never print the password
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("user", &self.credentials.as_ref().map(|(user, _)| format!("{}:*******", user)))
            .field("topic", &self.topic)
            .field("partition_count", &self.partition_count)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}
