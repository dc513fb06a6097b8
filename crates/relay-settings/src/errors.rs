//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

/// Why relay settings could not be loaded.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read relay settings at {}: {source}", path.display())]
    Read {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The settings file is not JSON.
    #[error("relay settings at {} are not valid JSON: {source}", path.display())]
    Malformed {
        /// File that was being parsed.
        path: PathBuf,
        /// Parser failure.
        #[source]
        source: serde_json::Error,
    },
    /// The merged JSON does not fit [`RelaySettings`](crate::RelaySettings),
    /// e.g. an unknown fan-out mode.
    #[error("relay settings have an unexpected shape: {0}")]
    Shape(#[from] serde_json::Error),
    /// A value parsed but is unusable (zero connections, empty host, ...).
    #[error("invalid relay setting: {0}")]
    InvalidValue(String),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_error_names_the_file() {
        let err = SettingsError::Read {
            path: PathBuf::from("/etc/relay/settings.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/etc/relay/settings.json"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn invalid_value_display() {
        let err = SettingsError::InvalidValue("server.port out of range".to_string());
        assert_eq!(err.to_string(), "invalid relay setting: server.port out of range");
    }
}
