//! # relay-core
//!
//! Foundation types shared by every relay crate:
//!
//! - **Envelopes**: [`Envelope`], one opaque unit of payload moving through the pipeline
//! - **Queues**: [`queue`] hand-off buffers carrying [`Frame`]s with an explicit close variant
//! - **Branded IDs**: [`SessionId`], [`EnvelopeId`] as newtypes for type safety
//! - **Errors**: [`RelayError`], [`ParseError`], [`TransformError`] via `thiserror`
//! - **Logging**: `tracing` subscriber setup and an in-memory capture helper for tests

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod queue;
pub mod types;

pub use envelope::Envelope;
pub use errors::{ParseError, RelayError, Result, TransformError};
pub use ids::{EnvelopeId, SessionId};
pub use queue::{Frame, QueueReceiver, QueueSender, queue};
pub use types::{FanOutMode, TransformKind};
