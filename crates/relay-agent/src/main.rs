//! # relay-agent
//!
//! Relay server binary. Resolves settings, installs logging and metrics,
//! then runs the relay until a termination signal drains it.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;
use relay_core::logging::{self, LogFormat};
use relay_core::{FanOutMode, TransformKind};
use relay_server::{Relay, ServerConfig, metrics};
use relay_settings::RelaySettings;
use tracing::{error, info, warn};

/// Bidirectional WebSocket relay.
#[derive(Parser, Debug)]
#[command(name = "relay-agent", about = "Bidirectional WebSocket relay")]
struct Cli {
    /// Host to bind (overrides settings if specified).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings if specified).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file. Defaults to `~/.relay/settings.json`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Result delivery: `broadcast` or `targeted`.
    #[arg(long)]
    fan_out: Option<FanOutMode>,

    /// Processing transform: `echo` or `discard`.
    #[arg(long)]
    transform: Option<TransformKind>,

    /// Upper bound on graceful shutdown, in milliseconds.
    #[arg(long)]
    shutdown_timeout_ms: Option<u64>,

    /// Maximum concurrent client sessions.
    #[arg(long)]
    max_connections: Option<usize>,

    /// Log filter directive (`RUST_LOG` still wins when set).
    #[arg(long)]
    log_level: Option<String>,

    /// Log output: `compact` or `json`.
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Skip installing the Prometheus recorder; `/metrics` then returns 404.
    #[arg(long)]
    no_metrics: bool,
}

impl Cli {
    /// Layer command-line flags over loaded settings.
    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(max) = self.max_connections {
            settings.server.max_connections = max;
        }
        if let Some(mode) = self.fan_out {
            settings.relay.fan_out = mode;
        }
        if let Some(kind) = self.transform {
            settings.relay.transform = kind;
        }
        if let Some(ms) = self.shutdown_timeout_ms {
            settings.relay.shutdown_timeout_ms = ms;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if let Some(format) = self.log_format {
            settings.logging.format = format;
        }
    }
}

/// Load settings (defaults, file, `RELAY_*` env), then apply CLI flags.
///
/// An explicit `--config` path must exist; the default path may be absent.
fn resolve_settings(cli: &Cli) -> Result<RelaySettings> {
    let mut settings = match &cli.config {
        Some(path) => {
            if !path.exists() {
                bail!("settings file not found: {}", path.display());
            }
            relay_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?
        }
        None => relay_settings::load_settings().context("Failed to load settings")?,
    };
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let settings = resolve_settings(&cli)?;

    logging::init_subscriber(&settings.logging.level, settings.logging.format);

    let mut builder = Relay::builder(ServerConfig::from(&settings));
    if !cli.no_metrics {
        match metrics::install_recorder() {
            Ok(handle) => builder = builder.metrics(handle),
            Err(e) => warn!(error = %e, "metrics recorder not installed"),
        }
    }
    let relay = builder.build();

    let addr = match relay.start().await {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "relay failed to start");
            return Ok(ExitCode::FAILURE);
        }
    };
    info!(
        url = %format!("ws://{addr}/ws"),
        fan_out = %settings.relay.fan_out,
        transform = %settings.relay.transform,
        "relay listening"
    );

    match relay.wait().await {
        Ok(()) => {
            info!("relay stopped");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            warn!(error = %e, "relay stopped uncleanly");
            Ok(ExitCode::FAILURE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["relay-agent"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    fn settings_file(json: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, json).unwrap();
        (dir, path)
    }

    #[test]
    fn cli_defaults_leave_settings_untouched() {
        let parsed = cli(&[]);
        assert!(parsed.host.is_none());
        assert!(parsed.port.is_none());
        assert!(!parsed.no_metrics);

        let mut settings = RelaySettings::default();
        parsed.apply(&mut settings);
        assert_eq!(settings.server.port, 8765);
        assert_eq!(settings.relay.fan_out, FanOutMode::Broadcast);
    }

    #[test]
    fn cli_custom_port() {
        let parsed = cli(&["--port", "9000"]);
        assert_eq!(parsed.port, Some(9000));
    }

    #[test]
    fn cli_parses_enums() {
        let parsed = cli(&[
            "--fan-out",
            "targeted",
            "--transform",
            "discard",
            "--log-format",
            "json",
        ]);
        assert_eq!(parsed.fan_out, Some(FanOutMode::Targeted));
        assert_eq!(parsed.transform, Some(TransformKind::Discard));
        assert_eq!(parsed.log_format, Some(LogFormat::Json));
    }

    #[test]
    fn cli_rejects_unknown_fan_out() {
        let result = Cli::try_parse_from(["relay-agent", "--fan-out", "multicast"]);
        assert!(result.is_err());
    }

    #[test]
    fn cli_overrides_apply() {
        let parsed = cli(&[
            "--host",
            "0.0.0.0",
            "--shutdown-timeout-ms",
            "250",
            "--max-connections",
            "4",
            "--log-level",
            "debug",
        ]);
        let mut settings = RelaySettings::default();
        parsed.apply(&mut settings);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.relay.shutdown_timeout_ms, 250);
        assert_eq!(settings.server.max_connections, 4);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn resolve_reads_config_file() {
        let (_dir, path) = settings_file(r#"{"server":{"port":7000},"relay":{"fanOut":"targeted"}}"#);
        let parsed = cli(&["--config", path.to_str().unwrap()]);
        let settings = resolve_settings(&parsed).unwrap();
        assert_eq!(settings.server.port, 7000);
        assert_eq!(settings.relay.fan_out, FanOutMode::Targeted);
    }

    #[test]
    fn resolve_flags_win_over_file() {
        let (_dir, path) = settings_file(r#"{"server":{"port":7000}}"#);
        let parsed = cli(&["--config", path.to_str().unwrap(), "--port", "7001"]);
        let settings = resolve_settings(&parsed).unwrap();
        assert_eq!(settings.server.port, 7001);
    }

    #[test]
    fn resolve_missing_explicit_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let parsed = cli(&["--config", path.to_str().unwrap()]);
        let err = resolve_settings(&parsed).unwrap_err();
        assert!(err.to_string().contains("settings file not found"));
    }

    #[test]
    fn resolve_rejects_invalid_override() {
        let (_dir, path) = settings_file("{}");
        let parsed = cli(&["--config", path.to_str().unwrap(), "--max-connections", "0"]);
        assert!(resolve_settings(&parsed).is_err());
    }
}
