//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Call once at startup,
/// before any metric is recorded; a second call fails.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants.

/// Sessions opened (counter).
pub const SESSIONS_OPENED_TOTAL: &str = "relay_sessions_opened_total";
/// Sessions closed (counter).
pub const SESSIONS_CLOSED_TOTAL: &str = "relay_sessions_closed_total";
/// Live sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "relay_sessions_active";
/// Upgrades refused because of the connection cap or shutdown (counter).
pub const SESSIONS_REJECTED_TOTAL: &str = "relay_sessions_rejected_total";
/// Session lifetime in seconds (histogram).
pub const SESSION_DURATION_SECONDS: &str = "relay_session_duration_seconds";
/// Envelopes accepted into the inbound queue (counter).
pub const ENVELOPES_RECEIVED_TOTAL: &str = "relay_envelopes_received_total";
/// Results written to a client transport (counter).
pub const ENVELOPES_RELAYED_TOTAL: &str = "relay_envelopes_relayed_total";
/// Malformed inbound messages (counter).
pub const PARSE_ERRORS_TOTAL: &str = "relay_parse_errors_total";
/// Transform failures (counter).
pub const TRANSFORM_ERRORS_TOTAL: &str = "relay_transform_errors_total";
/// Results dropped because the target session was closing (counter).
pub const FANOUT_DROPS_TOTAL: &str = "relay_fanout_drops_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_prefixed() {
        for name in [
            SESSIONS_OPENED_TOTAL,
            SESSIONS_CLOSED_TOTAL,
            SESSIONS_ACTIVE,
            SESSIONS_REJECTED_TOTAL,
            SESSION_DURATION_SECONDS,
            ENVELOPES_RECEIVED_TOTAL,
            ENVELOPES_RELAYED_TOTAL,
            PARSE_ERRORS_TOTAL,
            TRANSFORM_ERRORS_TOTAL,
            FANOUT_DROPS_TOTAL,
        ] {
            assert!(name.starts_with("relay_"), "{name}");
        }
    }

    #[test]
    fn render_from_unregistered_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(ENVELOPES_RECEIVED_TOTAL).increment(3);
        });
        let output = render(&handle);
        assert!(output.contains("relay_envelopes_received_total 3"));
    }
}
