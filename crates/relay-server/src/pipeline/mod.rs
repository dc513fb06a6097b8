//! Processing pipeline: inbound queue → worker → outbound queue → fan-out.

pub mod fanout;
pub mod transform;
pub mod worker;

pub use fanout::{Delivery, FanOut};
pub use transform::{DiscardTransform, EchoTransform, Transform};
pub use worker::{ProcessingWorker, WorkerHandle, WorkerStats};
