//! FIFO hand-off queues between networking and processing.
//!
//! A queue carries [`Frame`]s: either a payload item or the explicit
//! [`Frame::Close`] marker that tells the consumer to stop. Keeping the marker
//! a separate variant means no payload value (an empty string, JSON `null`)
//! can ever be mistaken for it.
//!
//! Queues are unbounded and multi-producer. The receiving half is not
//! `Clone`, so each queue has exactly one consumer; FIFO order holds between
//! pushes that complete before a later push begins. Pushes racing from
//! different producers land in whatever order they reach the queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;

use crate::errors::RelayError;

/// One entry in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<T> {
    /// A payload to process.
    Item(T),
    /// Stop consuming.
    Close,
}

/// Create a new unbounded queue.
pub fn queue<T>() -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        QueueSender {
            tx,
            depth: Arc::clone(&depth),
        },
        QueueReceiver { rx, depth },
    )
}

/// Producer half of a queue. Cheap to clone.
#[derive(Debug)]
pub struct QueueSender<T> {
    tx: mpsc::UnboundedSender<Frame<T>>,
    depth: Arc<AtomicUsize>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            depth: Arc::clone(&self.depth),
        }
    }
}

impl<T> QueueSender<T> {
    /// Enqueue a payload item.
    pub fn push(&self, item: T) -> Result<(), RelayError> {
        let _ = self.depth.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(Frame::Item(item)).is_err() {
            let _ = self.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(RelayError::QueueClosed);
        }
        Ok(())
    }

    /// Enqueue the close marker. Items pushed before it are still delivered.
    pub fn close(&self) -> Result<(), RelayError> {
        self.tx
            .send(Frame::Close)
            .map_err(|_| RelayError::QueueClosed)
    }

    /// Whether the consumer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Number of payload items waiting to be pulled.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

/// Consumer half of a queue.
#[derive(Debug)]
pub struct QueueReceiver<T> {
    rx: mpsc::UnboundedReceiver<Frame<T>>,
    depth: Arc<AtomicUsize>,
}

impl<T> QueueReceiver<T> {
    /// Wait for the next frame.
    ///
    /// Returns `None` once every sender has been dropped and the queue is
    /// drained. Cancel-safe: dropping the future never loses a frame.
    pub async fn pull(&mut self) -> Option<Frame<T>> {
        let frame = self.rx.recv().await;
        self.account(frame.as_ref());
        frame
    }

    /// Take the next frame if one is ready, without waiting.
    pub fn try_pull(&mut self) -> Option<Frame<T>> {
        let frame = self.rx.try_recv().ok();
        self.account(frame.as_ref());
        frame
    }

    /// Number of payload items waiting to be pulled.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    fn account(&self, frame: Option<&Frame<T>>) {
        if let Some(Frame::Item(_)) = frame {
            let _ = self.depth.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
