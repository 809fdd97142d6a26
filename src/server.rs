// `server.rs` composes the service: it loads configuration, registers
// Prometheus metrics, starts the telemetry receiver in the background and
// mounts the HTTP polling endpoints and middleware.
use crate::{config::Config, handlers, metrics::CacheMetrics, mqtt::MqttConnector, receiver::LatestTelemetryCache};
use axum::{routing::get, Router, Extension};
use prometheus::Registry;
use std::sync::Arc;
use tokio::task;
use axum::http::Method;
use tower_http::cors::{Any, CorsLayer};

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!(descriptor = ?config.descriptor, "loaded configuration");

    let registry = Arc::new(Registry::new());
    let metrics = CacheMetrics::register(&registry)?;

    let cache = Arc::new(LatestTelemetryCache::with_metrics(MqttConnector, config.descriptor.clone(), metrics));

    // start() only returns once subscriptions are open (or setup failed), so
    // run it in the background and serve the default snapshot meanwhile.
    let starter = Arc::clone(&cache);
    task::spawn(async move {
        starter.start().await;
    });

    let app = router(cache.reader(), registry);

    tracing::info!(bind_addr = %config.bind_addr, "listening");
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cache.stop().await;
    Ok(())
}

/// Build the HTTP app. Layers are applied from bottom -> top: the
/// `Extension` layers provide shared state (reader and registry) to
/// handlers. The CORS layer is mounted last so browser dashboards polling
/// `/telemetry` from another origin get their preflights answered.
pub fn router(reader: crate::receiver::TelemetryReader, registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/telemetry", get(handlers::get_telemetry))
        .route("/partitions", get(handlers::list_partitions))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/health", get(|| async { "ok" }))
        .layer(Extension(reader))
        .layer(Extension(registry))
        .layer(cors())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down...");
}

/// Read-only API: any origin may GET.
fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any)
}
