//! The two loops that service one session: transport → inbound queue, and
//! outbound queue → transport.
//!
//! Both loops are generic over the transport halves so they can be driven by
//! an in-memory stream/sink in tests. Each loop owns a [`DirectionGuard`];
//! whichever loop exits last removes the session from the registry.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, close_code};
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge, histogram};
use relay_core::{Envelope, Frame, QueueReceiver, QueueSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::registry::SessionRegistry;
use super::session::Session;
use crate::metrics::{
    ENVELOPES_RECEIVED_TOTAL, ENVELOPES_RELAYED_TOTAL, PARSE_ERRORS_TOTAL, SESSION_DURATION_SECONDS,
    SESSIONS_ACTIVE, SESSIONS_CLOSED_TOTAL,
};

/// Reason text sent with the close frame on shutdown.
const SHUTDOWN_REASON: &str = "relay shutting down";

/// Server ping cadence and the silence tolerated before giving up on a client.
#[derive(Clone, Copy, Debug)]
pub struct Heartbeat {
    /// Interval between pings.
    pub interval: Duration,
    /// Silence after which the transport is treated as closed.
    pub timeout: Duration,
}

/// Why a loop ended.
///
/// This is the session-level outcome. A closed transport is expected and
/// never surfaces as an error: it tears down only this session. Parse
/// failures do not end the loop at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopExit {
    /// Shutdown was signalled (receive loop) or the close marker was
    /// reached and the close frame sent (send loop).
    Shutdown,
    /// The transport failed, the peer closed, or the peer went silent.
    TransportClosed,
}

/// Decrements the session's direction count on drop and tears the session
/// down when the last loop leaves. Runs even if the loop task is aborted.
struct DirectionGuard {
    session: Arc<Session>,
    registry: Arc<SessionRegistry>,
}

impl Drop for DirectionGuard {
    fn drop(&mut self) {
        if !self.session.leave_direction() {
            return;
        }
        let _ = self.registry.remove(self.session.id());
        counter!(SESSIONS_CLOSED_TOTAL).increment(1);
        gauge!(SESSIONS_ACTIVE).decrement(1.0);
        histogram!(SESSION_DURATION_SECONDS).record(self.session.connected_for().as_secs_f64());
        info!(
            session_id = %self.session.id(),
            dropped = self.session.dropped_count(),
            "session closed"
        );
    }
}

/// Read frames from the client and push parsed envelopes onto the inbound
/// queue.
///
/// Malformed payloads are logged and skipped; the connection stays open.
/// Exits on shutdown, on peer close, or when the send loop reports the
/// transport gone.
#[instrument(skip_all, fields(session_id = %session.id()))]
pub(crate) async fn receive_loop<S>(
    mut stream: S,
    session: Arc<Session>,
    registry: Arc<SessionRegistry>,
    inbound: QueueSender<Envelope>,
    shutdown: CancellationToken,
) -> LoopExit
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let _guard = DirectionGuard {
        session: Arc::clone(&session),
        registry,
    };
    let transport_closed = session.transport_closed_token();

    let exit = loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => break LoopExit::Shutdown,
            () = transport_closed.cancelled() => break LoopExit::TransportClosed,
            next = stream.next() => next,
        };

        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!(error = %e, "transport read failed");
                break LoopExit::TransportClosed;
            }
            None => {
                debug!("transport stream ended");
                break LoopExit::TransportClosed;
            }
        };
        session.mark_seen();

        let parsed = match msg {
            Message::Text(text) => Envelope::parse(text.as_str(), Some(session.id().clone())),
            Message::Binary(data) => Envelope::parse_bytes(&data, Some(session.id().clone())),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                debug!("client sent close frame");
                break LoopExit::TransportClosed;
            }
        };

        match parsed {
            Ok(envelope) => {
                debug!(envelope_id = %envelope.id(), "envelope received");
                if inbound.push(envelope).is_err() {
                    warn!("inbound queue closed, dropping envelope");
                } else {
                    counter!(ENVELOPES_RECEIVED_TOTAL).increment(1);
                }
            }
            Err(e) => {
                counter!(PARSE_ERRORS_TOTAL).increment(1);
                warn!(error = %e, "dropping malformed message");
            }
        }
    };

    if exit == LoopExit::TransportClosed {
        session.mark_transport_closed();
    }
    exit
}

/// Drain the session's outbound queue onto the transport.
///
/// On the close marker every earlier item has already been written; the loop
/// then sends a close frame and closes the sink. Also pings the client on
/// the heartbeat interval and gives up on a client that stays silent past
/// the heartbeat timeout.
#[instrument(skip_all, fields(session_id = %session.id()))]
pub(crate) async fn send_loop<K>(
    mut sink: K,
    session: Arc<Session>,
    registry: Arc<SessionRegistry>,
    mut outbound: QueueReceiver<Arc<str>>,
    heartbeat: Heartbeat,
) -> LoopExit
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    let _guard = DirectionGuard {
        session: Arc::clone(&session),
        registry,
    };
    let transport_closed = session.transport_closed_token();
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat.interval,
        heartbeat.interval,
    );

    let exit = loop {
        tokio::select! {
            biased;
            () = transport_closed.cancelled() => break LoopExit::TransportClosed,
            frame = outbound.pull() => match frame {
                Some(Frame::Item(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.to_string().into())).await {
                        debug!(error = %e, "transport write failed");
                        break LoopExit::TransportClosed;
                    }
                    counter!(ENVELOPES_RELAYED_TOTAL).increment(1);
                }
                Some(Frame::Close) | None => {
                    let frame = CloseFrame {
                        code: close_code::AWAY,
                        reason: SHUTDOWN_REASON.to_owned().into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        debug!(error = %e, "close frame not delivered");
                    }
                    let _ = sink.close().await;
                    break LoopExit::Shutdown;
                }
            },
            _ = ping.tick() => {
                if session.idle_for() > heartbeat.timeout {
                    warn!(timeout = ?heartbeat.timeout, "client unresponsive, closing session");
                    break LoopExit::TransportClosed;
                }
                if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                    debug!(error = %e, "ping write failed");
                    break LoopExit::TransportClosed;
                }
            }
        }
    };

    session.mark_transport_closed();
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use relay_core::SessionId;
    use serde_json::json;

    const LONG: Heartbeat = Heartbeat {
        interval: Duration::from_secs(3600),
        timeout: Duration::from_secs(7200),
    };

    struct Harness {
        session: Arc<Session>,
        registry: Arc<SessionRegistry>,
        outbound_rx: Option<QueueReceiver<Arc<str>>>,
    }

    fn harness() -> Harness {
        let (session, outbound_rx) = Session::new(SessionId::new());
        let registry = Arc::new(SessionRegistry::new());
        assert!(registry.insert(Arc::clone(&session)));
        Harness {
            session,
            registry,
            outbound_rx: Some(outbound_rx),
        }
    }

    type Incoming = mpsc::UnboundedSender<Result<Message, axum::Error>>;

    fn spawn_receive(
        h: &Harness,
        inbound: QueueSender<Envelope>,
        shutdown: CancellationToken,
    ) -> (Incoming, tokio::task::JoinHandle<LoopExit>) {
        let (tx, rx) = mpsc::unbounded();
        let task = tokio::spawn(receive_loop(
            rx,
            Arc::clone(&h.session),
            Arc::clone(&h.registry),
            inbound,
            shutdown,
        ));
        (tx, task)
    }

    fn spawn_send(
        h: &mut Harness,
        heartbeat: Heartbeat,
    ) -> (mpsc::UnboundedReceiver<Message>, tokio::task::JoinHandle<LoopExit>) {
        let (tx, rx) = mpsc::unbounded();
        let outbound = h.outbound_rx.take().unwrap();
        let task = tokio::spawn(send_loop(
            tx,
            Arc::clone(&h.session),
            Arc::clone(&h.registry),
            outbound,
            heartbeat,
        ));
        (rx, task)
    }

    #[tokio::test]
    async fn text_and_binary_frames_become_envelopes() {
        let h = harness();
        let (inbound, mut inbound_rx) = relay_core::queue();
        let (tx, _task) = spawn_receive(&h, inbound, CancellationToken::new());

        tx.unbounded_send(Ok(Message::Text(r#"{"type":"ping"}"#.to_owned().into())))
            .unwrap();
        tx.unbounded_send(Ok(Message::Binary(br#"[1,2]"#.to_vec().into())))
            .unwrap();

        let Some(Frame::Item(first)) = inbound_rx.pull().await else {
            panic!("expected envelope");
        };
        assert_eq!(first.parsed(), &json!({"type": "ping"}));
        assert_eq!(first.origin(), Some(h.session.id()));

        let Some(Frame::Item(second)) = inbound_rx.pull().await else {
            panic!("expected envelope");
        };
        assert_eq!(second.parsed(), &json!([1, 2]));
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let h = harness();
        let (inbound, mut inbound_rx) = relay_core::queue();
        let (tx, task) = spawn_receive(&h, inbound, CancellationToken::new());

        tx.unbounded_send(Ok(Message::Text("not json".to_owned().into())))
            .unwrap();
        tx.unbounded_send(Ok(Message::Binary(vec![0xff, 0xfe].into())))
            .unwrap();
        tx.unbounded_send(Ok(Message::Text(r#"{"ok":true}"#.to_owned().into())))
            .unwrap();

        let Some(Frame::Item(env)) = inbound_rx.pull().await else {
            panic!("expected envelope");
        };
        assert_eq!(env.parsed(), &json!({"ok": true}));
        assert!(!task.is_finished());
        assert!(h.session.is_alive());
    }

    #[tokio::test]
    async fn peer_close_marks_transport_closed() {
        let h = harness();
        let (inbound, _inbound_rx) = relay_core::queue();
        let (tx, task) = spawn_receive(&h, inbound, CancellationToken::new());

        tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        assert_eq!(task.await.unwrap(), LoopExit::TransportClosed);
        assert!(h.session.is_transport_closed());
    }

    #[tokio::test]
    async fn stream_end_marks_transport_closed() {
        let h = harness();
        let (inbound, _inbound_rx) = relay_core::queue();
        let (tx, task) = spawn_receive(&h, inbound, CancellationToken::new());

        drop(tx);
        assert_eq!(task.await.unwrap(), LoopExit::TransportClosed);
        assert!(h.session.is_transport_closed());
    }

    #[tokio::test]
    async fn shutdown_stops_receiving_without_closing_transport() {
        let h = harness();
        let (inbound, _inbound_rx) = relay_core::queue();
        let shutdown = CancellationToken::new();
        let (_tx, task) = spawn_receive(&h, inbound, shutdown.clone());

        shutdown.cancel();
        assert_eq!(task.await.unwrap(), LoopExit::Shutdown);
        assert!(!h.session.is_transport_closed());
    }

    #[tokio::test]
    async fn queued_items_are_flushed_before_close_frame() {
        let mut h = harness();
        let (mut written, task) = spawn_send(&mut h, LONG);

        assert!(h.session.enqueue(Arc::from("a")));
        assert!(h.session.enqueue(Arc::from("b")));
        assert!(h.session.request_close());

        assert_eq!(task.await.unwrap(), LoopExit::Shutdown);
        let frames: Vec<Message> = written.by_ref().collect().await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], Message::Text("a".to_owned().into()));
        assert_eq!(frames[1], Message::Text("b".to_owned().into()));
        assert!(matches!(
            &frames[2],
            Message::Close(Some(f)) if f.code == close_code::AWAY
        ));
        assert!(h.session.is_transport_closed());
    }

    #[tokio::test]
    async fn write_failure_marks_transport_closed() {
        let mut h = harness();
        let (written, task) = spawn_send(&mut h, LONG);
        drop(written);

        assert!(h.session.enqueue(Arc::from("lost")));
        assert_eq!(task.await.unwrap(), LoopExit::TransportClosed);
        assert!(h.session.is_transport_closed());
    }

    #[tokio::test]
    async fn last_loop_out_unregisters_session() {
        let mut h = harness();
        let (inbound, _inbound_rx) = relay_core::queue();
        let (tx, recv_task) = spawn_receive(&h, inbound, CancellationToken::new());
        let (_written, send_task) = spawn_send(&mut h, LONG);

        drop(tx);
        assert_eq!(recv_task.await.unwrap(), LoopExit::TransportClosed);
        assert_eq!(send_task.await.unwrap(), LoopExit::TransportClosed);
        assert!(h.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_then_gives_up_on_silent_client() {
        let mut h = harness();
        let heartbeat = Heartbeat {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(25),
        };
        let (mut written, task) = spawn_send(&mut h, heartbeat);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(matches!(written.next().await, Some(Message::Ping(_))));

        let exit = tokio::time::timeout(Duration::from_secs(60), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, LoopExit::TransportClosed);
        assert!(h.session.is_transport_closed());
    }
}
