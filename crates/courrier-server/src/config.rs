//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::time::Duration;

use courrier_hub::HubConfig;
use courrier_shared::constants::{DEFAULT_HTTP_PORT, READ_COALESCE_MS, TYPING_TTL_SECS};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP/WebSocket (axum) server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Courrier Node"`
    pub instance_name: String,

    /// Typing indicator time-to-live in seconds.
    /// Env: `TYPING_TTL_SECS`
    /// Default: `5`
    pub typing_ttl_secs: u64,

    /// Read receipt coalescing window in milliseconds.
    /// Env: `READ_COALESCE_MS`
    /// Default: `300`
    pub read_coalesce_ms: u64,

    /// Sustained handshake rate allowed per client IP, in requests/second.
    /// Env: `RATE_LIMIT_PER_SEC`
    /// Default: `10`
    pub rate_limit_per_sec: f64,

    /// Burst capacity of the per-IP rate limiter.
    /// Env: `RATE_LIMIT_BURST`
    /// Default: `30`
    pub rate_limit_burst: f64,

    /// Maximum number of concurrently attached connections (0 = unlimited).
    /// Env: `MAX_CONNECTIONS`
    /// Default: `0`
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            instance_name: "Courrier Node".to_string(),
            typing_ttl_secs: TYPING_TTL_SECS,
            read_coalesce_ms: READ_COALESCE_MS,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
            max_connections: 0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(
                    value = %addr,
                    "Invalid HTTP_ADDR, using default"
                );
            }
        }

        if let Ok(name) = std::env::var("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Ok(val) = std::env::var("TYPING_TTL_SECS") {
            if let Ok(n) = val.parse::<u64>() {
                config.typing_ttl_secs = n;
            }
        }

        if let Ok(val) = std::env::var("READ_COALESCE_MS") {
            if let Ok(n) = val.parse::<u64>() {
                config.read_coalesce_ms = n;
            }
        }

        if let Ok(val) = std::env::var("RATE_LIMIT_PER_SEC") {
            if let Ok(n) = val.parse::<f64>() {
                config.rate_limit_per_sec = n;
            }
        }

        if let Ok(val) = std::env::var("RATE_LIMIT_BURST") {
            if let Ok(n) = val.parse::<f64>() {
                config.rate_limit_burst = n;
            }
        }

        if let Ok(val) = std::env::var("MAX_CONNECTIONS") {
            if let Ok(n) = val.parse::<usize>() {
                config.max_connections = n;
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// The hub tunables carried by this configuration.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            typing_ttl: Duration::from_secs(self.typing_ttl_secs),
            read_coalesce: Duration::from_millis(self.read_coalesce_ms),
            ..HubConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.typing_ttl_secs, 5);
        assert_eq!(config.read_coalesce_ms, 300);
        assert_eq!(config.max_connections, 0);
    }

    #[test]
    fn test_hub_config_carries_windows() {
        let config = ServerConfig {
            typing_ttl_secs: 7,
            read_coalesce_ms: 150,
            ..ServerConfig::default()
        };
        let hub_config = config.hub_config();
        assert_eq!(hub_config.typing_ttl, Duration::from_secs(7));
        assert_eq!(hub_config.read_coalesce, Duration::from_millis(150));
    }
}
