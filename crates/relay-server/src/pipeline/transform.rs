//! Pluggable transforms applied by the processing worker.

use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{Envelope, TransformError, TransformKind};
use tracing::info;

/// A function from one inbound envelope to zero or one result envelopes.
///
/// Returning `Ok(None)` consumes the envelope without producing a result.
/// Returning `Err` drops only this envelope; the worker keeps running.
#[async_trait]
pub trait Transform: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Process one envelope.
    async fn apply(&self, envelope: Envelope) -> Result<Option<Envelope>, TransformError>;
}

/// Returns every envelope unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoTransform;

#[async_trait]
impl Transform for EchoTransform {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn apply(&self, envelope: Envelope) -> Result<Option<Envelope>, TransformError> {
        Ok(Some(envelope))
    }
}

/// Logs every envelope and produces nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscardTransform;

#[async_trait]
impl Transform for DiscardTransform {
    fn name(&self) -> &'static str {
        "discard"
    }

    async fn apply(&self, envelope: Envelope) -> Result<Option<Envelope>, TransformError> {
        info!(
            envelope_id = %envelope.id(),
            origin = envelope.origin().map(relay_core::SessionId::as_str),
            payload = %envelope.raw(),
            "envelope consumed"
        );
        Ok(None)
    }
}

/// Build the built-in transform named by `kind`.
pub fn build(kind: TransformKind) -> Arc<dyn Transform> {
    match kind {
        TransformKind::Echo => Arc::new(EchoTransform),
        TransformKind::Discard => Arc::new(DiscardTransform),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::logging::capture_logs;
    use serde_json::json;
    use tracing::Level;

    fn envelope(raw: &str) -> Envelope {
        Envelope::parse(raw, None).unwrap()
    }

    #[tokio::test]
    async fn echo_is_identity() {
        let input = envelope(r#"{"type":"ping","n":[1,2]}"#);
        let id = input.id().clone();
        let out = EchoTransform.apply(input).await.unwrap().unwrap();
        assert_eq!(out.id(), &id);
        assert_eq!(out.parsed(), &json!({"type": "ping", "n": [1, 2]}));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn discard_logs_and_produces_nothing() {
        let (logs, _guard) = capture_logs();
        let out = DiscardTransform.apply(envelope("[1]")).await.unwrap();
        assert!(out.is_none());
        assert!(logs.has_event(Level::INFO, "envelope consumed"));
    }

    #[test]
    fn build_selects_by_kind() {
        assert_eq!(build(TransformKind::Echo).name(), "echo");
        assert_eq!(build(TransformKind::Discard).name(), "discard");
    }
}
