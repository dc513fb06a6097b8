//! Runtime configuration for the relay server.

use std::time::Duration;

use relay_core::{FanOutMode, RelayError, TransformKind};
use relay_settings::RelaySettings;

/// Resolved server configuration.
///
/// Built from [`RelaySettings`] by the binary; tests construct it directly.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port (`0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent sessions; upgrades beyond this get HTTP 503.
    pub max_connections: usize,
    /// Largest accepted WebSocket message in bytes.
    pub max_message_size: usize,
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// Silence after which a client is treated as gone.
    pub heartbeat_timeout: Duration,
    /// Where processed results are delivered.
    pub fan_out: FanOutMode,
    /// Built-in transform applied by the processing worker.
    pub transform: TransformKind,
    /// Upper bound on graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    /// `host:port` string suitable for `TcpListener::bind`.
    ///
    /// Bare IPv6 literals are bracketed.
    pub fn bind_address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Reject values the gateway cannot run with.
    ///
    /// Settings loaded from disk are already validated; this covers configs
    /// built in code.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.heartbeat_interval.is_zero() {
            return Err(RelayError::InvalidConfig(
                "heartbeat_interval must be positive".into(),
            ));
        }
        if self.heartbeat_timeout < self.heartbeat_interval {
            return Err(RelayError::InvalidConfig(
                "heartbeat_timeout must not be shorter than heartbeat_interval".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(RelayError::InvalidConfig(
                "max_connections must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&RelaySettings::default())
    }
}

impl From<&RelaySettings> for ServerConfig {
    fn from(settings: &RelaySettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_connections: settings.server.max_connections,
            max_message_size: settings.server.max_message_size,
            heartbeat_interval: Duration::from_millis(settings.server.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(settings.server.heartbeat_timeout_ms),
            fan_out: settings.relay.fan_out,
            transform: settings.relay.transform,
            shutdown_timeout: Duration::from_millis(settings.relay.shutdown_timeout_ms),
        }
    }
}
