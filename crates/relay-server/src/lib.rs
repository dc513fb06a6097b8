//! # relay-server
//!
//! Bidirectional WebSocket relay built on axum and tokio.
//!
//! - **Gateway**: listener, per-client sessions, receive and send loops
//! - **Pipeline**: single processing worker with a pluggable [`Transform`],
//!   and fan-out of results to session queues
//! - **Lifecycle**: [`Relay`] start/stop/wait with bounded graceful shutdown
//! - **Observability**: `/health` and Prometheus `/metrics`

#![deny(unsafe_code)]

pub mod config;
pub mod gateway;
pub mod health;
pub mod lifecycle;
pub mod metrics;
pub mod pipeline;
pub mod shutdown;

pub use config::ServerConfig;
pub use gateway::{Gateway, Session, SessionRegistry};
pub use lifecycle::{LifecycleState, Relay, RelayBuilder, RelayStats};
pub use pipeline::{DiscardTransform, EchoTransform, Transform};
