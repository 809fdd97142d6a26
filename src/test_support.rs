// In-memory messaging client for tests. Tests hold a `MemorySource` handle
// to push messages and errors into individual partitions; delivery calls the
// registered callbacks synchronously on the caller's task.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use async_trait::async_trait;
use serde_json::Value;

use crate::descriptor::ConnectionDescriptor;
use crate::error::TelemetryError;
use crate::source::{Connector, ErrorHandler, EventClient, MessageHandler, ReceiveOptions, Subscription};
use crate::telemetry::EventMessage;

#[derive(Default)]
struct SourceState {
    partitions: Vec<String>,
    fail_connect: Option<String>,
    fail_enumerate: Option<String>,
    fail_receive: Vec<String>,
    gates: HashMap<String, (Arc<Notify>, Arc<Notify>)>,
    routes: HashMap<String, (MessageHandler, ErrorHandler, ReceiveOptions)>,
    connects: usize,
    client_closed: bool,
}

#[derive(Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<SourceState>>,
}

impl MemorySource {
    pub fn with_partitions(ids: &[&str]) -> Self {
        let source = MemorySource::default();
        source.state.lock().unwrap().partitions = ids.iter().map(|s| s.to_string()).collect();
        source
    }

    pub fn fail_connect(&self, msg: &str) {
        self.state.lock().unwrap().fail_connect = Some(msg.to_string());
    }

    pub fn fail_enumerate(&self, msg: &str) {
        self.state.lock().unwrap().fail_enumerate = Some(msg.to_string());
    }

    pub fn fail_receive(&self, partition: &str) {
        self.state.lock().unwrap().fail_receive.push(partition.to_string());
    }

    /// Make `receive` on `partition` pause. The first `Notify` fires once the
    /// call is pending; notifying the second lets it complete.
    pub fn gate_receive(&self, partition: &str) -> (Arc<Notify>, Arc<Notify>) {
        let gate = (Arc::new(Notify::new()), Arc::new(Notify::new()));
        self.state.lock().unwrap().gates.insert(partition.to_string(), gate.clone());
        gate
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { source: self.clone() }
    }

    pub fn descriptor() -> ConnectionDescriptor {
        "HostName=memory;Topic=telemetry".parse().unwrap()
    }

    /// Deliver a message on a partition. Returns false if nothing is subscribed.
    pub fn deliver(&self, partition: &str, body: Value) -> bool {
        let handler = self.state.lock().unwrap().routes.get(partition).map(|(m, _, _)| m.clone());
        match handler {
            Some(on_message) => {
                on_message(EventMessage::new(partition, body));
                true
            }
            None => false,
        }
    }

    pub fn fail(&self, partition: &str, msg: &str) -> bool {
        let handler = self.state.lock().unwrap().routes.get(partition).map(|(_, e, _)| e.clone());
        match handler {
            Some(on_error) => {
                on_error(TelemetryError::receive(partition, msg));
                true
            }
            None => false,
        }
    }

    pub fn subscribed(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().unwrap().routes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn options(&self, partition: &str) -> Option<ReceiveOptions> {
        self.state.lock().unwrap().routes.get(partition).map(|(_, _, o)| *o)
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn client_closed(&self) -> bool {
        self.state.lock().unwrap().client_closed
    }
}

pub struct MemoryConnector {
    source: MemorySource,
}

#[async_trait]
impl Connector for MemoryConnector {
    type Client = MemoryClient;

    async fn connect(&self, _descriptor: &ConnectionDescriptor) -> Result<MemoryClient, TelemetryError> {
        let mut state = self.source.state.lock().unwrap();
        if let Some(msg) = &state.fail_connect {
            return Err(TelemetryError::Connect(msg.clone()));
        }
        state.connects += 1;
        Ok(MemoryClient { source: self.source.clone() })
    }
}

pub struct MemoryClient {
    source: MemorySource,
}

#[async_trait]
impl EventClient for MemoryClient {
    async fn partition_ids(&self) -> Result<Vec<String>, TelemetryError> {
        let state = self.source.state.lock().unwrap();
        match &state.fail_enumerate {
            Some(msg) => Err(TelemetryError::Connect(msg.clone())),
            None => Ok(state.partitions.clone()),
        }
    }

    async fn receive(
        &self,
        partition_id: &str,
        on_message: MessageHandler,
        on_error: ErrorHandler,
        options: ReceiveOptions,
    ) -> Result<Box<dyn Subscription>, TelemetryError> {
        let gate = self.source.state.lock().unwrap().gates.get(partition_id).cloned();
        if let Some((reached, release)) = gate {
            reached.notify_one();
            release.notified().await;
        }

        let mut state = self.source.state.lock().unwrap();
        if state.fail_receive.iter().any(|p| p == partition_id) {
            return Err(TelemetryError::receive(partition_id, "receiver rejected"));
        }
        state
            .routes
            .insert(partition_id.to_string(), (on_message, on_error, options));
        Ok(Box::new(MemorySubscription {
            partition_id: partition_id.to_string(),
            source: self.source.clone(),
        }))
    }

    async fn close(&self) -> Result<(), TelemetryError> {
        let mut state = self.source.state.lock().unwrap();
        state.routes.clear();
        state.client_closed = true;
        Ok(())
    }
}

struct MemorySubscription {
    partition_id: String,
    source: MemorySource,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn partition_id(&self) -> &str {
        &self.partition_id
    }

    async fn close(self: Box<Self>) -> Result<(), TelemetryError> {
        self.source.state.lock().unwrap().routes.remove(&self.partition_id);
        Ok(())
    }
}
