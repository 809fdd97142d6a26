// Telemetry data model: the cached snapshot and the message shape handed to
// the cache by a messaging client.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The last message body received from any partition.
///
/// The body is kept exactly as delivered. Devices are expected to send an
/// object of scalar fields (temperature, humidity, ...), but nothing enforces
/// that, so any JSON value can become the current snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TelemetrySnapshot(Value);

impl TelemetrySnapshot {
    pub fn new(body: Value) -> Self {
        TelemetrySnapshot(body)
    }

    /// Look up a single field. Returns `None` if the body is not an object.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.0.as_object().and_then(|obj| obj.get(name))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl Default for TelemetrySnapshot {
    // all-zero sentinel until the first message arrives
    fn default() -> Self {
        TelemetrySnapshot(serde_json::json!({ "temperature": 0, "humidity": 0 }))
    }
}

impl From<Value> for TelemetrySnapshot {
    fn from(body: Value) -> Self {
        TelemetrySnapshot(body)
    }
}

/// One event delivered on a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    pub partition_id: String,
    /// Telemetry sent by the device.
    pub body: Value,
    /// Arbitrary properties attached by the device.
    pub application_properties: Map<String, Value>,
    /// Properties added by the message source (topic, enqueued time, ...).
    pub annotations: Map<String, Value>,
    pub enqueued_time: DateTime<Utc>,
}

impl EventMessage {
    pub fn new(partition_id: impl Into<String>, body: Value) -> Self {
        EventMessage {
            partition_id: partition_id.into(),
            body,
            application_properties: Map::new(),
            annotations: Map::new(),
            enqueued_time: Utc::now(),
        }
    }

    /// Decode a raw payload. JSON is kept structured; anything else is
    /// carried as a (lossy UTF-8) string body.
    pub fn decode_body(payload: &[u8]) -> Value {
        match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(_) => Value::String(String::from_utf8_lossy(payload).into_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_snapshot_is_zeroed() {
        let snap = TelemetrySnapshot::default();
        assert_eq!(snap.field("temperature"), Some(&json!(0)));
        assert_eq!(snap.field("humidity"), Some(&json!(0)));
        assert_eq!(serde_json::to_string(&snap).unwrap(), r#"{"humidity":0,"temperature":0}"#);
    }

    #[test]
    fn test_non_object_snapshot_has_no_fields() {
        let snap = TelemetrySnapshot::new(json!([1, 2, 3]));
        assert_eq!(snap.field("temperature"), None);
        assert_eq!(snap.as_value(), &json!([1, 2, 3]));
    }

    #[test]
    fn test_decode_body() {
        assert_eq!(
            EventMessage::decode_body(br#"{"temperature":21.5,"humidity":40}"#),
            json!({ "temperature": 21.5, "humidity": 40 })
        );
        assert_eq!(EventMessage::decode_body(b"not json"), json!("not json"));
        assert_eq!(EventMessage::decode_body(&[0x66, 0xff]), json!("f\u{fffd}"));
    }
}
