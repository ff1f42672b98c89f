use crate::{env_or_default, env_parse_or, ConfigError, FromEnv};
use std::net::Ipv4Addr;

/// Server configuration for HTTP listeners (APIs, health/metrics endpoints)
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    /// Get the server address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Read host and port from custom variable names
    ///
    /// Used by workers whose only listener is the health server
    /// (e.g. `HEALTH_HOST` / `HEALTH_PORT`).
    pub fn from_env_keys(
        host_key: &str,
        port_key: &str,
        default_port: u16,
    ) -> Result<Self, ConfigError> {
        let host = env_or_default(host_key, &Ipv4Addr::UNSPECIFIED.to_string());
        let port = env_parse_or(port_key, default_port)?;

        Ok(Self { host, port })
    }
}

impl FromEnv for ServerConfig {
    /// Reads from environment variables with sensible defaults:
    /// - HOST: defaults to Ipv4Addr::UNSPECIFIED (0.0.0.0 - all interfaces)
    /// - PORT: defaults to 8080
    fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_keys("HOST", "PORT", 8080)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED.to_string(),
            port: 8080,
        }
    }
}
