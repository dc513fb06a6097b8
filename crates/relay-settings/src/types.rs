//! Settings types.
//!
//! Field names serialize in camelCase to match the settings file format.

use relay_core::logging::LogFormat;
use relay_core::{FanOutMode, TransformKind};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Listener and transport settings.
    pub server: ServerSettings,
    /// Pipeline and lifecycle settings.
    pub relay: RelayOptions,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject values that would make the relay unusable.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(SettingsError::InvalidValue("server.host is empty".into()));
        }
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be at least 1".into(),
            ));
        }
        if self.server.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalMs must be positive".into(),
            ));
        }
        if self.server.heartbeat_timeout_ms < self.server.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatTimeoutMs must not be shorter than the interval".into(),
            ));
        }
        if self.relay.shutdown_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "relay.shutdownTimeoutMs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Listener and transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent client sessions.
    pub max_connections: usize,
    /// Largest accepted frame in bytes.
    pub max_message_size: usize,
    /// Interval between server pings in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a client is considered gone, in milliseconds.
    pub heartbeat_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            max_connections: 256,
            max_message_size: 1024 * 1024,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
        }
    }
}

/// Pipeline and lifecycle settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayOptions {
    /// Where processed results are delivered.
    pub fan_out: FanOutMode,
    /// Which built-in transform the processing worker applies.
    pub transform: TransformKind,
    /// Upper bound on graceful shutdown in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            fan_out: FanOutMode::Broadcast,
            transform: TransformKind::Echo,
            shutdown_timeout_ms: 5_000,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (an `EnvFilter` directive such as `"info"` or `"relay_server=debug"`).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
