//! Event envelopes.
//!
//! An [`Envelope`] is created when a message comes off a socket (or when a
//! transform produces a result) and is immutable from then on. The relay never
//! looks inside `parsed`; it only needs the parse/serialize round trip.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::ParseError;
use crate::ids::{EnvelopeId, SessionId};

/// One unit of payload moving through the pipeline.
#[derive(Clone, Debug)]
pub struct Envelope {
    id: EnvelopeId,
    origin: Option<SessionId>,
    raw: Arc<str>,
    parsed: Value,
    received_at: DateTime<Utc>,
}

impl Envelope {
    /// Parse a text payload received from `origin`.
    ///
    /// Any well-formed JSON value is accepted, including `null`: the queue
    /// close marker is a separate frame variant, never a payload value.
    pub fn parse(raw: &str, origin: Option<SessionId>) -> Result<Self, ParseError> {
        if raw.trim().is_empty() {
            return Err(ParseError::new("empty payload"));
        }
        let parsed: Value = serde_json::from_str(raw)?;
        Ok(Self {
            id: EnvelopeId::new(),
            origin,
            raw: Arc::from(raw),
            parsed,
            received_at: Utc::now(),
        })
    }

    /// Parse a binary payload. The bytes must be UTF-8 encoded JSON.
    pub fn parse_bytes(raw: &[u8], origin: Option<SessionId>) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(raw)?;
        Self::parse(text, origin)
    }

    /// Build an envelope from an already structured value, keeping the
    /// origin of `self`. Used by transforms that produce a new payload.
    #[must_use]
    pub fn derive(&self, parsed: Value) -> Self {
        let raw: Arc<str> = Arc::from(parsed.to_string());
        Self {
            id: EnvelopeId::new(),
            origin: self.origin.clone(),
            raw,
            parsed,
            received_at: Utc::now(),
        }
    }

    /// Envelope ID.
    pub fn id(&self) -> &EnvelopeId {
        &self.id
    }

    /// Session the payload arrived on, if any.
    pub fn origin(&self) -> Option<&SessionId> {
        self.origin.as_ref()
    }

    /// The payload exactly as it was received.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The parsed payload.
    pub fn parsed(&self) -> &Value {
        &self.parsed
    }

    /// When the envelope was created.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Serialize the parsed payload for the wire.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.parsed)
    }
}
