// `main.rs` is intentionally tiny: it only delegates execution to
// `server::run()`. The cache, the MQTT connector and the HTTP surface live in
// the library so each responsibility is isolated and easier to test.

/// Start the service. Configuration comes from the environment
/// (`TELEMETRY_CONNECTION_STRING`, `HTTP_BIND_ADDR`, `RUST_LOG`).
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    iot_telemetry_cache::server::run().await
}
