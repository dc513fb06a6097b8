//! Per-client session state shared by the receive and send loops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use relay_core::{QueueReceiver, QueueSender, SessionId, queue};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Number of loops (receive + send) attached to each session.
const DIRECTIONS: usize = 2;

/// One connected client.
///
/// The session owns the producer side of its outbound queue. Fan-out pushes
/// serialized results into it; the send loop drains it. Closing the session
/// hands the queue a close marker and drops the producer, so nothing can be
/// enqueued after the marker.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    outbound: Mutex<Option<QueueSender<Arc<str>>>>,
    transport_closed: CancellationToken,
    alive: AtomicBool,
    directions: AtomicUsize,
    last_seen: Mutex<Instant>,
    connected_at: Instant,
    dropped: AtomicU64,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Session {
    /// Create a session and the consumer half of its outbound queue.
    pub fn new(id: SessionId) -> (Arc<Self>, QueueReceiver<Arc<str>>) {
        let (tx, rx) = queue();
        let now = Instant::now();
        let session = Arc::new(Self {
            id,
            outbound: Mutex::new(Some(tx)),
            transport_closed: CancellationToken::new(),
            alive: AtomicBool::new(true),
            directions: AtomicUsize::new(DIRECTIONS),
            last_seen: Mutex::new(now),
            connected_at: now,
            dropped: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        });
        (session, rx)
    }

    /// Session identifier.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// False once a close was requested or the transport went away.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Queue a serialized result for delivery.
    ///
    /// Returns `false` (and counts a drop) if the session is closing.
    pub fn enqueue(&self, message: Arc<str>) -> bool {
        let guard = self.outbound.lock();
        let delivered = guard.as_ref().is_some_and(|tx| tx.push(message).is_ok());
        drop(guard);
        if !delivered {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        delivered
    }

    /// Ask the send loop to flush what is queued, then close the transport.
    ///
    /// Returns `true` for the call that actually placed the close marker.
    pub fn request_close(&self) -> bool {
        self.alive.store(false, Ordering::Release);
        let Some(tx) = self.outbound.lock().take() else {
            return false;
        };
        tx.close().is_ok()
    }

    /// Record that the underlying transport is gone. Wakes both loops.
    pub fn mark_transport_closed(&self) {
        self.alive.store(false, Ordering::Release);
        let _ = self.outbound.lock().take();
        self.transport_closed.cancel();
    }

    /// Whether the transport has been closed.
    pub fn is_transport_closed(&self) -> bool {
        self.transport_closed.is_cancelled()
    }

    /// Token cancelled when the transport closes.
    pub fn transport_closed_token(&self) -> CancellationToken {
        self.transport_closed.clone()
    }

    /// Note inbound activity (any frame, including pongs).
    pub fn mark_seen(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the client last sent anything.
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Time since the session was accepted.
    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Results dropped because the session was closing.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queued results not yet written to the transport.
    pub fn pending(&self) -> usize {
        self.outbound.lock().as_ref().map_or(0, QueueSender::depth)
    }

    pub(crate) fn attach_tasks(&self, handles: impl IntoIterator<Item = AbortHandle>) {
        self.tasks.lock().extend(handles);
    }

    /// Abort both loops. Used only when graceful shutdown overruns.
    pub(crate) fn abort_tasks(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    /// Called by each loop on exit. Returns `true` for the last one out.
    pub(crate) fn leave_direction(&self) -> bool {
        self.directions.fetch_sub(1, Ordering::AcqRel) == 1
    }
}
