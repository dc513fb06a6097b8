//! Delivery of processed results to session outbound queues.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use relay_core::{Envelope, FanOutMode, Frame, QueueReceiver};
use tracing::{debug, info, warn};

use crate::gateway::SessionRegistry;
use crate::metrics::FANOUT_DROPS_TOTAL;

/// Outcome of delivering one result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Sessions the result was queued for.
    pub delivered: usize,
    /// Sessions that were closing and refused it.
    pub dropped: usize,
}

/// Routes results from the shared outbound queue to per-session queues.
///
/// Each result is serialized once and the same text is shared by every
/// recipient.
pub struct FanOut {
    mode: FanOutMode,
    registry: Arc<SessionRegistry>,
    dispatched: Arc<AtomicU64>,
}

impl FanOut {
    /// Create a dispatcher over the live session set.
    pub fn new(mode: FanOutMode, registry: Arc<SessionRegistry>) -> Self {
        Self {
            mode,
            registry,
            dispatched: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared counter of results taken off the outbound queue.
    pub fn dispatched_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dispatched)
    }

    /// Deliver one result according to the fan-out mode.
    pub fn deliver(&self, envelope: &Envelope) -> Delivery {
        let wire: Arc<str> = match envelope.to_wire() {
            Ok(text) => Arc::from(text),
            Err(e) => {
                warn!(envelope_id = %envelope.id(), error = %e, "result not serializable, dropping");
                return Delivery::default();
            }
        };

        let targets = match self.mode {
            FanOutMode::Broadcast => self.registry.snapshot(),
            FanOutMode::Targeted => envelope
                .origin()
                .and_then(|origin| self.registry.get(origin))
                .into_iter()
                .collect(),
        };

        let mut delivery = Delivery::default();
        for session in &targets {
            if session.enqueue(Arc::clone(&wire)) {
                delivery.delivered += 1;
            } else {
                delivery.dropped += 1;
            }
        }

        if delivery.dropped > 0 {
            counter!(FANOUT_DROPS_TOTAL).increment(delivery.dropped as u64);
            debug!(
                envelope_id = %envelope.id(),
                dropped = delivery.dropped,
                "result dropped for closing sessions"
            );
        }
        if targets.is_empty() {
            debug!(envelope_id = %envelope.id(), mode = %self.mode, "no recipient for result");
        }
        delivery
    }

    /// Deliver results until the outbound queue closes.
    ///
    /// Returns the number of results dispatched.
    pub async fn run(self, mut outbound: QueueReceiver<Envelope>) -> u64 {
        info!(mode = %self.mode, "fan-out started");
        while let Some(frame) = outbound.pull().await {
            let Frame::Item(envelope) = frame else {
                break;
            };
            let _ = self.deliver(&envelope);
            let _ = self.dispatched.fetch_add(1, Ordering::AcqRel);
        }
        let total = self.dispatched.load(Ordering::Acquire);
        info!(dispatched = total, "fan-out stopped");
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Session;
    use relay_core::{SessionId, queue};

    fn registry_with(n: usize) -> (Arc<SessionRegistry>, Vec<(Arc<Session>, QueueReceiver<Arc<str>>)>) {
        let registry = Arc::new(SessionRegistry::new());
        let sessions: Vec<_> = (0..n)
            .map(|_| {
                let (s, rx) = Session::new(SessionId::new());
                assert!(registry.insert(Arc::clone(&s)));
                (s, rx)
            })
            .collect();
        (registry, sessions)
    }

    #[test]
    fn broadcast_reaches_every_session() {
        let (registry, mut sessions) = registry_with(3);
        let fan_out = FanOut::new(FanOutMode::Broadcast, registry);
        let env = Envelope::parse(r#"{ "a" : 1 }"#, Some(sessions[0].0.id().clone())).unwrap();

        assert_eq!(
            fan_out.deliver(&env),
            Delivery {
                delivered: 3,
                dropped: 0
            }
        );
        for (_, rx) in &mut sessions {
            assert_eq!(rx.try_pull(), Some(Frame::Item(Arc::from(r#"{"a":1}"#))));
        }
    }

    #[test]
    fn targeted_reaches_only_origin() {
        let (registry, mut sessions) = registry_with(2);
        let fan_out = FanOut::new(FanOutMode::Targeted, registry);
        let origin = sessions[1].0.id().clone();
        let env = Envelope::parse("[1]", Some(origin)).unwrap();

        assert_eq!(fan_out.deliver(&env).delivered, 1);
        assert_eq!(sessions[0].1.try_pull(), None);
        assert_eq!(sessions[1].1.try_pull(), Some(Frame::Item(Arc::from("[1]"))));
    }

    #[test]
    fn targeted_without_live_origin_is_dropped_quietly() {
        let (registry, _sessions) = registry_with(1);
        let fan_out = FanOut::new(FanOutMode::Targeted, registry);
        let gone = Envelope::parse("1", Some(SessionId::new())).unwrap();
        let anonymous = Envelope::parse("2", None).unwrap();
        assert_eq!(fan_out.deliver(&gone), Delivery::default());
        assert_eq!(fan_out.deliver(&anonymous), Delivery::default());
    }

    #[test]
    fn closing_sessions_count_as_drops() {
        let (registry, sessions) = registry_with(2);
        assert!(sessions[0].0.request_close());
        let fan_out = FanOut::new(FanOutMode::Broadcast, registry);
        let env = Envelope::parse("true", None).unwrap();
        assert_eq!(
            fan_out.deliver(&env),
            Delivery {
                delivered: 1,
                dropped: 1
            }
        );
    }

    #[tokio::test]
    async fn run_exits_when_outbound_producers_are_gone() {
        let (registry, mut sessions) = registry_with(1);
        let fan_out = FanOut::new(FanOutMode::Broadcast, registry);
        let counter = fan_out.dispatched_counter();
        let (tx, rx) = queue();
        tx.push(Envelope::parse("1", None).unwrap()).unwrap();
        tx.push(Envelope::parse("2", None).unwrap()).unwrap();
        drop(tx);

        assert_eq!(fan_out.run(rx).await, 2);
        assert_eq!(counter.load(Ordering::Acquire), 2);
        let rx = &mut sessions[0].1;
        assert_eq!(rx.try_pull(), Some(Frame::Item(Arc::from("1"))));
        assert_eq!(rx.try_pull(), Some(Frame::Item(Arc::from("2"))));
    }
}
