// Latest-value telemetry cache. `start()` connects through the injected
// `Connector`, opens one subscription per partition and lets every delivery
// overwrite a single shared snapshot; readers poll it with `telemetry()`.
//
// Failures are logged and counted, never returned: a failed connect leaves
// the default snapshot in place, a failed partition just stops contributing.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::descriptor::ConnectionDescriptor;
use crate::error::TelemetryError;
use crate::metrics::CacheMetrics;
use crate::source::{Connector, ErrorHandler, EventClient, MessageHandler, ReceiveOptions, Subscription};
use crate::telemetry::{EventMessage, TelemetrySnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum PartitionState {
    Receiving,
    Failed(String),
    Closed,
}

/// State shared between the cache, its readers and the delivery callbacks.
struct Shared {
    latest: RwLock<Arc<TelemetrySnapshot>>,
    partitions: RwLock<BTreeMap<String, PartitionState>>,
    metrics: CacheMetrics,
}

impl Shared {
    fn new(metrics: CacheMetrics) -> Self {
        Shared {
            latest: RwLock::new(Arc::new(TelemetrySnapshot::default())),
            partitions: RwLock::new(BTreeMap::new()),
            metrics,
        }
    }

    fn snapshot(&self) -> Arc<TelemetrySnapshot> {
        Arc::clone(&self.latest.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn partition_states(&self) -> BTreeMap<String, PartitionState> {
        self.partitions.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the snapshot with the body of `message`, whatever its shape.
    fn update(&self, message: EventMessage) {
        tracing::info!(partition = %message.partition_id, body = %message.body, "telemetry received");
        tracing::debug!(
            partition = %message.partition_id,
            body = %message.body,
            application_properties = %serde_json::Value::Object(message.application_properties.clone()),
            annotations = %serde_json::Value::Object(message.annotations.clone()),
            enqueued_time = %message.enqueued_time,
            "message details"
        );
        self.metrics.messages.with_label_values(&[message.partition_id.as_str()]).inc();

        {
            let mut partitions = self.partitions.write().unwrap_or_else(PoisonError::into_inner);
            // the client reconnected after an error
            if let Some(state) = partitions.get_mut(&message.partition_id) {
                if matches!(state, PartitionState::Failed(_)) {
                    *state = PartitionState::Receiving;
                }
            }
        }

        let snapshot = Arc::new(TelemetrySnapshot::new(message.body));
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    fn record_error(&self, partition: &str, err: TelemetryError) {
        tracing::error!(partition, error = %err, "receive error");
        self.metrics.receive_errors.with_label_values(&[partition]).inc();
        let mut partitions = self.partitions.write().unwrap_or_else(PoisonError::into_inner);
        let state = partitions.entry(partition.to_string()).or_insert(PartitionState::Receiving);
        if *state != PartitionState::Closed {
            *state = PartitionState::Failed(err.to_string());
        }
    }

    fn set_receiving(&self, partition: &str) {
        self.partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(partition.to_string(), PartitionState::Receiving);
    }

    fn close_all(&self) {
        let mut partitions = self.partitions.write().unwrap_or_else(PoisonError::into_inner);
        for state in partitions.values_mut() {
            *state = PartitionState::Closed;
        }
    }
}

/// Read-only handle to the cached telemetry. Cheap to clone, never blocks
/// on I/O and never fails.
#[derive(Clone)]
pub struct TelemetryReader {
    shared: Arc<Shared>,
}

impl TelemetryReader {
    pub fn telemetry(&self) -> Arc<TelemetrySnapshot> {
        self.shared.snapshot()
    }

    pub fn partitions(&self) -> BTreeMap<String, PartitionState> {
        self.shared.partition_states()
    }
}

struct Session<T> {
    client: T,
    subscriptions: Vec<Box<dyn Subscription>>,
}

pub struct LatestTelemetryCache<C: Connector> {
    connector: C,
    descriptor: ConnectionDescriptor,
    shared: Arc<Shared>,
    session: tokio::sync::Mutex<Option<Session<C::Client>>>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl<C: Connector> LatestTelemetryCache<C> {
    /// Build the cache. No I/O happens until `start()`.
    pub fn new(connector: C, descriptor: ConnectionDescriptor) -> Self {
        Self::with_metrics(connector, descriptor, CacheMetrics::default())
    }

    /// Like `new`, counting deliveries and failures on `metrics`.
    pub fn with_metrics(connector: C, descriptor: ConnectionDescriptor, metrics: CacheMetrics) -> Self {
        LatestTelemetryCache {
            connector,
            descriptor,
            shared: Arc::new(Shared::new(metrics)),
            session: tokio::sync::Mutex::new(None),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn reader(&self) -> TelemetryReader {
        TelemetryReader {
            shared: Arc::clone(&self.shared),
        }
    }

    /// The most recently delivered body, or the default snapshot.
    pub fn telemetry(&self) -> Arc<TelemetrySnapshot> {
        self.shared.snapshot()
    }

    pub fn partitions(&self) -> BTreeMap<String, PartitionState> {
        self.shared.partition_states()
    }

    /// Connect, enumerate partitions and subscribe to each of them from the
    /// current enqueued time. Returns once subscriptions are open; messages
    /// keep arriving until `stop()`. Errors are logged, not returned.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("telemetry receiver already started");
            return;
        }

        // Held for the whole setup so that stop() waits until a cancelled
        // setup has closed whatever it opened.
        let mut slot = self.session.lock().await;
        if self.shutdown.is_cancelled() {
            tracing::info!("telemetry receiver stopped before start");
            return;
        }
        let session = match self.open_session().await {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::info!("start cancelled by stop");
                self.shared.close_all();
                return;
            }
            Err(e) => {
                self.shared.metrics.connect_errors.inc();
                tracing::error!(error = %e, "failed to start telemetry receiver");
                return;
            }
        };

        if self.shutdown.is_cancelled() {
            // stop() ran as the last subscription was being opened
            close_session(session).await;
            self.shared.close_all();
            return;
        }
        *slot = Some(session);
    }

    /// Close every subscription and the client connection, waiting for an
    /// in-flight `start()` to unwind first. The last snapshot stays readable;
    /// the cache cannot be started again.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            close_session(session).await;
        }
        self.shared.close_all();
        tracing::info!("telemetry receiver stopped");
    }

    /// Open the client and one subscription per partition. Every step races
    /// the shutdown token; on cancellation whatever was already opened is
    /// closed here and `Ok(None)` is returned.
    async fn open_session(&self) -> Result<Option<Session<C::Client>>, TelemetryError> {
        let client = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(None),
            res = self.connector.connect(&self.descriptor) => res?,
        };
        tracing::info!(host = %self.descriptor.host, "successfully created the event client");

        let ids = tokio::select! {
            _ = self.shutdown.cancelled() => None,
            res = client.partition_ids() => Some(res),
        };
        let ids = match ids {
            Some(Ok(ids)) => ids,
            Some(Err(e)) => {
                if let Err(close_err) = client.close().await {
                    tracing::warn!(error = %close_err, "failed to close client after enumeration error");
                }
                return Err(e);
            }
            None => {
                close_session(Session { client, subscriptions: Vec::new() }).await;
                return Ok(None);
            }
        };
        tracing::info!(partitions = ?ids, "partition ids");

        let mut session = Session {
            client,
            subscriptions: Vec::with_capacity(ids.len()),
        };
        for id in ids {
            if self.shutdown.is_cancelled() {
                close_session(session).await;
                return Ok(None);
            }
            self.shared.set_receiving(&id);
            let res = tokio::select! {
                biased;
                res = session.client.receive(
                    &id,
                    self.message_handler(),
                    self.error_handler(&id),
                    ReceiveOptions::from_now(),
                ) => Some(res),
                _ = self.shutdown.cancelled() => None,
            };
            match res {
                Some(Ok(sub)) => session.subscriptions.push(sub),
                Some(Err(e)) => self.shared.record_error(&id, e),
                None => {
                    // partially opened: close what we have
                    close_session(session).await;
                    return Ok(None);
                }
            }
        }

        Ok(Some(session))
    }

    fn message_handler(&self) -> MessageHandler {
        let shared = Arc::clone(&self.shared);
        Arc::new(move |message| shared.update(message))
    }

    fn error_handler(&self, partition: &str) -> ErrorHandler {
        let shared = Arc::clone(&self.shared);
        let partition = partition.to_string();
        Arc::new(move |err| shared.record_error(&partition, err))
    }
}

async fn close_session<T: EventClient>(session: Session<T>) {
    for sub in session.subscriptions {
        let partition = sub.partition_id().to_string();
        if let Err(e) = sub.close().await {
            tracing::warn!(partition = %partition, error = %e, "failed to close subscription");
        }
    }
    if let Err(e) = session.client.close().await {
        tracing::warn!(error = %e, "failed to close event client");
    }
}
