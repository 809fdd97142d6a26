// HTTP handlers for the service. These are thin wrappers around the shared
// `TelemetryReader` and the Prometheus `Registry`; none of them waits on the
// message source.
use crate::receiver::{PartitionState, TelemetryReader};
use crate::telemetry::TelemetrySnapshot;
use axum::{extract::Extension, http::{HeaderMap, HeaderValue, header::CONTENT_TYPE}, Json};
use prometheus::{Encoder, Registry, TextEncoder};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Return the current snapshot: the last delivered body, or the zeroed
/// default before anything arrived.
pub async fn get_telemetry(Extension(reader): Extension<TelemetryReader>) -> Json<TelemetrySnapshot> {
    Json(reader.telemetry().as_ref().clone())
}

/// Per-partition receive state.
pub async fn list_partitions(Extension(reader): Extension<TelemetryReader>) -> Json<BTreeMap<String, PartitionState>> {
    Json(reader.partitions())
}

/// Expose Prometheus text-format metrics gathered from the provided
/// `Registry` extension.
pub async fn metrics_handler(Extension(registry): Extension<Arc<Registry>>) -> (HeaderMap, String) {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    let body = String::from_utf8_lossy(&buffer).to_string();

    let mut headers = HeaderMap::new();
    if let Ok(ct) = HeaderValue::from_str(encoder.format_type()) {
        headers.insert(CONTENT_TYPE, ct);
    }
    (headers, body)
}
