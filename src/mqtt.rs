// MQTT-backed messaging client. This connects to the broker using `rumqttc`
// and maps each partition to its own topic under the configured namespace
// (`{Topic}/{partition}`). One background task drives the event loop and
// routes every incoming publish to the callbacks of the partition whose topic
// it arrived on.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Incoming, MqttOptions, Outgoing, Publish, QoS};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::descriptor::ConnectionDescriptor;
use crate::error::TelemetryError;
use crate::source::{Connector, ErrorHandler, EventClient, MessageHandler, ReceiveOptions, Subscription};
use crate::telemetry::EventMessage;

struct Route {
    partition_id: String,
    on_message: MessageHandler,
    on_error: ErrorHandler,
    options: ReceiveOptions,
}

/// Topic -> route. Shared by the client, its subscriptions and the driver.
type Routes = Arc<Mutex<HashMap<String, Route>>>;

#[derive(Debug, Default, Clone, Copy)]
pub struct MqttConnector;

/// Build MQTT options from the descriptor.
pub fn mqtt_options(descriptor: &ConnectionDescriptor) -> MqttOptions {
    let mut options = MqttOptions::new(&descriptor.client_id, &descriptor.host, descriptor.port);
    options.set_keep_alive(descriptor.keep_alive);

    match &descriptor.credentials {
        Some((user, pass)) => {
            options.set_credentials(user, pass);
            tracing::info!("using MQTT credentials {}:*******", user);
        }
        None => {
            // No credentials configured; proceed unauthenticated.
            tracing::info!("no MQTT credentials provided; connecting without authentication");
        }
    }
    options
}

#[async_trait]
impl Connector for MqttConnector {
    type Client = MqttClient;

    /// Connect and wait for the broker's ConnAck. Any poll error before that
    /// fails the connect.
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<MqttClient, TelemetryError> {
        tracing::info!(host = %descriptor.host, port = descriptor.port, "connecting to MQTT broker");
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(descriptor), 10);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    tracing::debug!(?ack, "connected");
                    break;
                }
                Ok(ev) => tracing::trace!(?ev, "event before ConnAck"),
                Err(e) => return Err(TelemetryError::Connect(e.to_string())),
            }
        }

        let routes = Routes::default();
        let driver = tokio::spawn(drive(eventloop, client.clone(), Arc::clone(&routes)));

        Ok(MqttClient {
            client,
            descriptor: descriptor.clone(),
            routes,
            driver: Mutex::new(Some(driver)),
        })
    }
}

pub struct MqttClient {
    client: AsyncClient,
    descriptor: ConnectionDescriptor,
    routes: Routes,
    driver: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl EventClient for MqttClient {
    // MQTT has no partition enumeration; the descriptor declares the count.
    async fn partition_ids(&self) -> Result<Vec<String>, TelemetryError> {
        Ok(self.descriptor.partition_ids())
    }

    async fn receive(
        &self,
        partition_id: &str,
        on_message: MessageHandler,
        on_error: ErrorHandler,
        options: ReceiveOptions,
    ) -> Result<Box<dyn Subscription>, TelemetryError> {
        let topic = self.descriptor.partition_topic(partition_id);
        lock(&self.routes).insert(
            topic.clone(),
            Route {
                partition_id: partition_id.to_string(),
                on_message,
                on_error,
                options,
            },
        );

        if let Err(e) = self.client.subscribe(&topic, QoS::AtLeastOnce).await {
            lock(&self.routes).remove(&topic);
            return Err(TelemetryError::receive(partition_id, e));
        }
        tracing::info!(partition = partition_id, topic = %topic, "subscribed to MQTT topic");

        Ok(Box::new(MqttSubscription {
            partition_id: partition_id.to_string(),
            topic,
            client: self.client.clone(),
            routes: Arc::clone(&self.routes),
        }))
    }

    async fn close(&self) -> Result<(), TelemetryError> {
        lock(&self.routes).clear();
        let res = self
            .client
            .disconnect()
            .await
            .map_err(|e| TelemetryError::Connect(e.to_string()));

        let driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut driver) = driver {
            // give the driver a moment to flush the Disconnect packet
            if tokio::time::timeout(Duration::from_secs(2), &mut driver).await.is_err() {
                driver.abort();
            }
        }
        res
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.lock().unwrap_or_else(PoisonError::into_inner).take() {
            driver.abort();
        }
    }
}

struct MqttSubscription {
    partition_id: String,
    topic: String,
    client: AsyncClient,
    routes: Routes,
}

#[async_trait]
impl Subscription for MqttSubscription {
    fn partition_id(&self) -> &str {
        &self.partition_id
    }

    async fn close(self: Box<Self>) -> Result<(), TelemetryError> {
        lock(&self.routes).remove(&self.topic);
        self.client
            .unsubscribe(&self.topic)
            .await
            .map_err(|e| TelemetryError::receive(&self.partition_id, e))
    }
}

fn lock(routes: &Routes) -> std::sync::MutexGuard<'_, HashMap<String, Route>> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the driver does with one poll result.
#[derive(Debug, PartialEq)]
enum Step {
    Dispatch(Publish),
    Resubscribe,
    Stop,
    Backoff(String),
    Ignore,
}

fn step(polled: Result<Event, ConnectionError>, reconnecting: bool) -> Step {
    match polled {
        Ok(Event::Incoming(Incoming::Publish(p))) => Step::Dispatch(p),
        Ok(Event::Incoming(Incoming::ConnAck(_))) if reconnecting => Step::Resubscribe,
        Ok(Event::Incoming(i)) => {
            tracing::trace!(?i, "incoming");
            Step::Ignore
        }
        Ok(Event::Outgoing(Outgoing::Disconnect)) => Step::Stop,
        Ok(Event::Outgoing(o)) => {
            tracing::trace!(?o, "outgoing");
            Step::Ignore
        }
        Err(e) => Step::Backoff(e.to_string()),
    }
}

/// Queue a subscribe for every routed topic; returns how many were queued.
/// try_subscribe: awaiting here would block the loop that drains requests.
fn resubscribe(client: &AsyncClient, routes: &Routes) -> usize {
    let topics: Vec<String> = lock(routes).keys().cloned().collect();
    tracing::info!(topics = topics.len(), "reconnected to MQTT broker, resubscribing");
    let mut queued = 0;
    for topic in topics {
        match client.try_subscribe(&topic, QoS::AtLeastOnce) {
            Ok(()) => queued += 1,
            Err(e) => tracing::warn!(topic = %topic, error = %e, "resubscribe failed"),
        }
    }
    queued
}

/// Drive the event loop until the client disconnects. Connection errors are
/// reported to every partition; rumqttc reconnects on the next poll and the
/// topics are subscribed again once the broker acknowledges.
async fn drive(mut eventloop: EventLoop, client: AsyncClient, routes: Routes) {
    let mut reconnecting = false;
    loop {
        match step(eventloop.poll().await, reconnecting) {
            Step::Dispatch(p) => dispatch(&routes, p, Utc::now()),
            Step::Resubscribe => {
                reconnecting = false;
                resubscribe(&client, &routes);
            }
            Step::Stop => {
                tracing::info!("disconnected from MQTT broker");
                break;
            }
            Step::Backoff(err) => {
                reconnecting = true;
                report_error(&routes, &err);
                // Back off on errors to avoid busy loops.
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Step::Ignore => {}
        }
    }
}

fn report_error(routes: &Routes, message: &str) {
    let handlers: Vec<(String, ErrorHandler)> = lock(routes)
        .values()
        .map(|r| (r.partition_id.clone(), Arc::clone(&r.on_error)))
        .collect();
    for (partition, on_error) in handlers {
        on_error(TelemetryError::receive(partition, message));
    }
}

fn dispatch(routes: &Routes, publish: Publish, received: DateTime<Utc>) {
    let route = lock(routes)
        .get(&publish.topic)
        .map(|r| (r.partition_id.clone(), Arc::clone(&r.on_message), r.options));
    let Some((partition_id, on_message, options)) = route else {
        tracing::trace!(topic = %publish.topic, "publish on unrouted topic");
        return;
    };

    // Retained publishes are broker backlog from before the subscription.
    if publish.retain && !options.position.replays_backlog() {
        tracing::debug!(topic = %publish.topic, "skipping retained message");
        return;
    }
    if !options.position.admits(received) {
        return;
    }

    on_message(to_event_message(&partition_id, &publish, received));
}

fn to_event_message(partition_id: &str, publish: &Publish, received: DateTime<Utc>) -> EventMessage {
    let mut annotations = Map::new();
    annotations.insert("mqtt-topic".into(), Value::String(publish.topic.clone()));
    annotations.insert("mqtt-qos".into(), Value::from(publish.qos as u8));
    annotations.insert("mqtt-retain".into(), Value::Bool(publish.retain));
    annotations.insert("enqueued-time".into(), Value::String(received.to_rfc3339()));

    EventMessage {
        partition_id: partition_id.to_string(),
        body: EventMessage::decode_body(&publish.payload),
        application_properties: Map::new(),
        annotations,
        enqueued_time: received,
    }
}
