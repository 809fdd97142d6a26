// Prometheus counters for the cache. They are created unregistered by
// `Default` so the cache works without a registry; `server::run()` registers
// them on the registry served at `/metrics`.
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

#[derive(Clone)]
pub struct CacheMetrics {
    pub messages: IntCounterVec,
    pub receive_errors: IntCounterVec,
    pub connect_errors: IntCounter,
}

impl CacheMetrics {
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = CacheMetrics::default();
        registry.register(Box::new(metrics.messages.clone()))?;
        registry.register(Box::new(metrics.receive_errors.clone()))?;
        registry.register(Box::new(metrics.connect_errors.clone()))?;
        Ok(metrics)
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        // Names and label sets are constant, construction cannot fail.
        CacheMetrics {
            messages: IntCounterVec::new(
                Opts::new("telemetry_messages_total", "Telemetry messages received per partition"),
                &["partition"],
            )
            .expect("valid metric definition"),
            receive_errors: IntCounterVec::new(
                Opts::new("telemetry_receive_errors_total", "Receive errors reported per partition"),
                &["partition"],
            )
            .expect("valid metric definition"),
            connect_errors: IntCounter::new(
                "telemetry_connect_errors_total",
                "Failed connect or partition enumeration attempts",
            )
            .expect("valid metric definition"),
        }
    }
}
