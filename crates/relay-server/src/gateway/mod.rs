//! WebSocket gateway: owns the listening socket and the live session set.
//!
//! Every accepted connection becomes a [`Session`] serviced by two tasks,
//! a receive loop and a send loop, tracked so shutdown can wait for them.

pub mod connection;
pub mod registry;
pub mod session;

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::{Sink, Stream, StreamExt};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use relay_core::{Envelope, QueueSender, RelayError, SessionId};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::metrics::{SESSIONS_ACTIVE, SESSIONS_OPENED_TOTAL, SESSIONS_REJECTED_TOTAL};
use connection::{Heartbeat, receive_loop, send_loop};
pub use registry::SessionRegistry;
pub use session::Session;

/// Accepts client connections and runs their sessions.
pub struct Gateway {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    inbound: QueueSender<Envelope>,
    shutdown: CancellationToken,
    sessions: TaskTracker,
    routes: Router,
    server: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Gateway {
    /// Create a gateway that pushes parsed envelopes onto `inbound`.
    ///
    /// `routes` are extra HTTP routes (health, metrics) served alongside
    /// `/ws` on the same listener.
    pub fn new(
        config: ServerConfig,
        registry: Arc<SessionRegistry>,
        inbound: QueueSender<Envelope>,
        shutdown: CancellationToken,
        routes: Router,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            inbound,
            shutdown,
            sessions: TaskTracker::new(),
            routes,
            server: Mutex::new(None),
            local_addr: Mutex::new(None),
        })
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Returns the bound address (useful with port `0`). Fails with
    /// [`RelayError::InvalidConfig`] before binding if the config cannot run.
    pub async fn start(self: &Arc<Self>, bind_address: &str) -> Result<SocketAddr, RelayError> {
        self.config.validate()?;
        let bind_error = |source| RelayError::Bind {
            addr: bind_address.to_string(),
            source,
        };
        let listener = TcpListener::bind(bind_address).await.map_err(bind_error)?;
        let addr = listener.local_addr().map_err(bind_error)?;

        let router = self.router();
        let token = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "accept loop failed");
            }
        });

        *self.server.lock() = Some(handle);
        *self.local_addr.lock() = Some(addr);
        info!(%addr, "gateway listening");
        Ok(addr)
    }

    fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(Arc::clone(self))
            .merge(self.routes.clone())
    }

    /// Register a new session for `transport` and spawn its loops.
    ///
    /// Returns `None` (and drops the transport) if shutdown has begun.
    pub fn on_accept<T>(&self, transport: T) -> Option<Arc<Session>>
    where
        T: Stream<Item = Result<Message, axum::Error>> + Sink<Message> + Send + 'static,
        <T as Sink<Message>>::Error: Display + Send + 'static,
    {
        let (session, outbound) = Session::new(SessionId::new());
        if !self.registry.insert(Arc::clone(&session)) {
            debug!(session_id = %session.id(), "connection arrived after shutdown, closing");
            counter!(SESSIONS_REJECTED_TOTAL).increment(1);
            return None;
        }
        counter!(SESSIONS_OPENED_TOTAL).increment(1);
        gauge!(SESSIONS_ACTIVE).increment(1.0);
        info!(session_id = %session.id(), live = self.registry.len(), "session opened");

        let heartbeat = Heartbeat {
            interval: self.config.heartbeat_interval,
            timeout: self.config.heartbeat_timeout,
        };
        let (sink, stream) = transport.split();
        let recv = self.sessions.spawn(receive_loop(
            stream,
            Arc::clone(&session),
            Arc::clone(&self.registry),
            self.inbound.clone(),
            self.shutdown.clone(),
        ));
        let send = self.sessions.spawn(send_loop(
            sink,
            Arc::clone(&session),
            Arc::clone(&self.registry),
            outbound,
            heartbeat,
        ));
        session.attach_tasks([recv.abort_handle(), send.abort_handle()]);
        Some(session)
    }

    /// Begin shutdown: stop accepting and stop reading from clients.
    ///
    /// Sessions stay registered with their send loops running, so results
    /// still in the pipeline can reach them. Call
    /// [`close_sessions`](Self::close_sessions) once the pipeline has
    /// drained. Returns the number of sessions live at this point.
    pub fn stop(&self) -> usize {
        self.shutdown.cancel();
        let live = self.registry.close().len();
        info!(sessions = live, "gateway stopping");
        live
    }

    /// Ask every live session to flush its queue and close the transport.
    ///
    /// Returns the number of sessions that received a close marker. Calls
    /// after the first find nothing left to close.
    pub fn close_sessions(&self) -> usize {
        let live = self.registry.snapshot();
        let pending: usize = live.iter().map(|s| s.pending()).sum();
        let requested = live.iter().filter(|s| s.request_close()).count();
        if requested > 0 {
            info!(sessions = requested, pending, "closing sessions");
        }
        requested
    }

    /// Wait for the accept loop and every session task to finish.
    pub async fn join(&self) {
        let server = self.server.lock().take();
        if let Some(handle) = server {
            if let Err(e) = handle.await {
                warn!(error = %e, "accept loop task failed");
            }
        }
        let _ = self.sessions.close();
        self.sessions.wait().await;
        debug!("all session tasks finished");
    }

    /// Tear down whatever is still running after graceful shutdown overran.
    ///
    /// Returns the number of sessions that had to be forced.
    pub fn force_close(&self) -> usize {
        let remaining = self.registry.snapshot();
        for session in &remaining {
            session.mark_transport_closed();
            session.abort_tasks();
            let _ = self.registry.remove(session.id());
        }
        if let Some(handle) = self.server.lock().take() {
            handle.abort();
        }
        if !remaining.is_empty() {
            warn!(sessions = remaining.len(), "forced sessions closed");
        }
        remaining.len()
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Live session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(gateway): State<Arc<Gateway>>) -> Response {
    if gateway.registry.is_closed() {
        counter!(SESSIONS_REJECTED_TOTAL).increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "relay is shutting down").into_response();
    }
    let live = gateway.registry.len();
    if live >= gateway.config.max_connections {
        counter!(SESSIONS_REJECTED_TOTAL).increment(1);
        warn!(live, max = gateway.config.max_connections, "connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }
    ws.max_message_size(gateway.config.max_message_size)
        .on_upgrade(move |socket| async move {
            let _ = gateway.on_accept(socket);
        })
}
