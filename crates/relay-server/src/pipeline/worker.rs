//! The processing worker: pulls envelopes from the inbound queue, applies
//! the transform, and pushes results to the outbound queue.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use metrics::counter;
use relay_core::{Envelope, Frame, QueueReceiver, QueueSender};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use super::transform::Transform;
use crate::metrics::TRANSFORM_ERRORS_TOTAL;

/// Counters reported when the worker exits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Envelopes pulled from the inbound queue.
    pub processed: u64,
    /// Results pushed to the outbound queue.
    pub produced: u64,
    /// Envelopes the transform rejected, failed on, or panicked on.
    pub failed: u64,
}

/// Single consumer of the inbound queue.
pub struct ProcessingWorker {
    inbound: QueueReceiver<Envelope>,
    outbound: QueueSender<Envelope>,
    transform: Arc<dyn Transform>,
}

impl ProcessingWorker {
    /// Create a worker between two queues.
    pub fn new(
        inbound: QueueReceiver<Envelope>,
        outbound: QueueSender<Envelope>,
        transform: Arc<dyn Transform>,
    ) -> Self {
        Self {
            inbound,
            outbound,
            transform,
        }
    }

    /// Process envelopes until the close marker arrives or every inbound
    /// producer is gone.
    ///
    /// Envelopes queued before the marker are all processed. The marker is
    /// never passed to the transform or forwarded. Dropping `self` on exit
    /// releases the outbound producer, which lets fan-out finish.
    pub async fn run(mut self) -> WorkerStats {
        let mut stats = WorkerStats::default();
        info!(transform = self.transform.name(), "processing worker started");

        loop {
            let envelope = match self.inbound.pull().await {
                Some(Frame::Item(envelope)) => envelope,
                Some(Frame::Close) => {
                    debug!("close marker reached");
                    break;
                }
                None => {
                    debug!("inbound producers gone");
                    break;
                }
            };
            stats.processed += 1;
            let envelope_id = envelope.id().clone();

            let outcome = AssertUnwindSafe(self.transform.apply(envelope))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(Some(result))) => {
                    if self.outbound.push(result).is_ok() {
                        stats.produced += 1;
                        debug!(%envelope_id, "envelope transformed");
                    } else {
                        warn!(%envelope_id, "outbound queue closed, dropping result");
                    }
                }
                Ok(Ok(None)) => debug!(%envelope_id, "transform produced no result"),
                Ok(Err(e)) => {
                    stats.failed += 1;
                    counter!(TRANSFORM_ERRORS_TOTAL).increment(1);
                    warn!(%envelope_id, error = %e, "transform failed, skipping envelope");
                }
                Err(_) => {
                    stats.failed += 1;
                    counter!(TRANSFORM_ERRORS_TOTAL).increment(1);
                    error!(%envelope_id, "transform panicked, skipping envelope");
                }
            }
        }

        info!(
            processed = stats.processed,
            produced = stats.produced,
            failed = stats.failed,
            "processing worker stopped"
        );
        stats
    }

    /// Run the worker on its own task.
    ///
    /// `control` must feed the same queue as the worker's inbound receiver;
    /// the handle uses it to deliver the close marker.
    pub fn spawn(self, control: QueueSender<Envelope>) -> WorkerHandle {
        WorkerHandle {
            control,
            task: tokio::spawn(self.run()),
        }
    }
}

/// Handle to a running worker.
pub struct WorkerHandle {
    control: QueueSender<Envelope>,
    task: JoinHandle<WorkerStats>,
}

impl WorkerHandle {
    /// Enqueue exactly one close marker behind any pending envelopes and
    /// wait for the worker to drain them and exit.
    ///
    /// Returns `None` if the worker task was aborted or panicked.
    pub async fn stop(self) -> Option<WorkerStats> {
        if self.control.close().is_err() {
            debug!("worker already gone");
        }
        match self.task.await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "processing worker did not exit cleanly");
                None
            }
        }
    }

    /// Handle for aborting the worker if shutdown overruns.
    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }
}
