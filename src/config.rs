// Process configuration, read from environment variables. The connection
// string is a secret and is never taken from source or logged in full.
use anyhow::Context;

use crate::descriptor::ConnectionDescriptor;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

#[derive(Debug, Clone)]
pub struct Config {
    pub descriptor: ConnectionDescriptor,
    pub bind_addr: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let conn = var("TELEMETRY_CONNECTION_STRING")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("TELEMETRY_CONNECTION_STRING environment variable must be set"))?;
        let descriptor = conn
            .parse::<ConnectionDescriptor>()
            .context("TELEMETRY_CONNECTION_STRING is not a valid connection string")?;

        let bind_addr = var("HTTP_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

        Ok(Config { descriptor, bind_addr })
    }
}
