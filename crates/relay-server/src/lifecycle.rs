//! Lifecycle coordination: builds the relay, starts it, and shuts it down in
//! order.
//!
//! ```text
//! CREATED ──start──▶ RUNNING ──stop/signal──▶ STOPPING ──▶ STOPPED
//!    └──────────────────────stop──────────────────────────────▲
//! ```
//!
//! Shutdown order:
//! 1. Trigger the shutdown signal and stop the gateway (no new sessions, no
//!    new reads).
//! 2. Send the worker its close marker and wait for it to drain.
//! 3. Wait for fan-out to deliver the last results into the session queues.
//! 4. Give every session its close marker and wait for each to flush and
//!    close.
//!
//! Steps 2 to 4 share one deadline. Anything still running when it passes
//! is aborted and [`Relay::wait`] reports [`RelayError::ShutdownTimeout`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use relay_core::{Envelope, QueueReceiver, QueueSender, RelayError, queue};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::gateway::{Gateway, SessionRegistry};
use crate::health::{StatusState, status_routes};
use crate::pipeline::{FanOut, ProcessingWorker, Transform, WorkerHandle, transform};
use crate::shutdown::{ShutdownCoordinator, TerminationSignals};

/// Relay lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Built but not started.
    Created,
    /// Accepting connections and relaying.
    Running,
    /// Draining.
    Stopping,
    /// Terminal.
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Point-in-time counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayStats {
    /// Live sessions.
    pub sessions: usize,
    /// Envelopes waiting for the processing worker.
    pub inbound_depth: usize,
    /// Results handed to fan-out so far.
    pub dispatched: u64,
}

/// Configures and builds a [`Relay`].
pub struct RelayBuilder {
    config: ServerConfig,
    transform: Option<Arc<dyn Transform>>,
    metrics: Option<PrometheusHandle>,
    handle_signals: bool,
}

impl RelayBuilder {
    /// Use a custom transform instead of the one named in the config.
    #[must_use]
    pub fn transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Serve `/metrics` from this Prometheus handle.
    #[must_use]
    pub fn metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Whether `start` installs SIGINT/SIGTERM handlers (default `true`).
    #[must_use]
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Wire the queues, worker, fan-out, and gateway. Nothing runs until
    /// [`Relay::start`].
    pub fn build(self) -> Relay {
        let transform = self
            .transform
            .unwrap_or_else(|| transform::build(self.config.transform));
        let shutdown = ShutdownCoordinator::new();
        let registry = Arc::new(SessionRegistry::new());
        let (inbound_tx, inbound_rx) = queue();
        let (outbound_tx, outbound_rx) = queue();
        let (state, state_rx) = watch::channel(LifecycleState::Created);
        let start_time = Instant::now();

        let routes = status_routes(StatusState {
            start_time,
            lifecycle: state_rx,
            registry: Arc::clone(&registry),
            inbound: inbound_tx.clone(),
            metrics: self.metrics,
        });
        let gateway = Gateway::new(
            self.config.clone(),
            Arc::clone(&registry),
            inbound_tx.clone(),
            shutdown.token(),
            routes,
        );
        let fan_out = FanOut::new(self.config.fan_out, registry);
        let dispatched = fan_out.dispatched_counter();

        Relay {
            inner: Arc::new(RelayInner {
                config: self.config,
                handle_signals: self.handle_signals,
                shutdown,
                state,
                gateway,
                inbound: inbound_tx,
                dispatched,
                timed_out: AtomicBool::new(false),
                transition: tokio::sync::Mutex::new(()),
                pending: Mutex::new(Some(Pending {
                    worker: ProcessingWorker::new(inbound_rx, outbound_tx, transform),
                    fan_out,
                    outbound: outbound_rx,
                })),
                running: Mutex::new(None),
            }),
        }
    }
}

/// Pipeline pieces built but not yet spawned.
struct Pending {
    worker: ProcessingWorker,
    fan_out: FanOut,
    outbound: QueueReceiver<Envelope>,
}

/// Handles to the spawned pipeline tasks.
struct Running {
    worker: WorkerHandle,
    fan_out: JoinHandle<u64>,
}

impl Running {
    fn abort_handles(&self) -> [AbortHandle; 2] {
        [self.worker.abort_handle(), self.fan_out.abort_handle()]
    }
}

struct RelayInner {
    config: ServerConfig,
    handle_signals: bool,
    shutdown: ShutdownCoordinator,
    state: watch::Sender<LifecycleState>,
    gateway: Arc<Gateway>,
    inbound: QueueSender<Envelope>,
    dispatched: Arc<AtomicU64>,
    timed_out: AtomicBool,
    /// Serializes `start` against the teardown half of `stop`.
    transition: tokio::sync::Mutex<()>,
    pending: Mutex<Option<Pending>>,
    running: Mutex<Option<Running>>,
}

/// The assembled relay: gateway, processing worker, and fan-out under one
/// lifecycle. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Relay {
    /// Start configuring a relay.
    pub fn builder(config: ServerConfig) -> RelayBuilder {
        RelayBuilder {
            config,
            transform: None,
            metrics: None,
            handle_signals: true,
        }
    }

    /// Build a relay with the transform named in `config`.
    pub fn new(config: ServerConfig) -> Self {
        Self::builder(config).build()
    }

    /// Bind the listener and start the pipeline.
    ///
    /// Fails with [`RelayError::InvalidConfig`] (relay stays `Created`) if
    /// the config cannot run, with [`RelayError::InvalidState`] unless the
    /// relay is `Created`, and with [`RelayError::Bind`] if the address
    /// cannot be bound, in which case the relay ends up `Stopped`.
    pub async fn start(&self) -> Result<SocketAddr, RelayError> {
        self.inner.config.validate()?;
        let _transition = self.inner.transition.lock().await;
        let started = self.inner.state.send_if_modified(|state| {
            if *state == LifecycleState::Created {
                *state = LifecycleState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(RelayError::InvalidState {
                action: "start",
                state: self.state().to_string(),
            });
        }
        let pending = self.inner.pending.lock().take();
        let Some(pending) = pending else {
            return Err(RelayError::InvalidState {
                action: "start",
                state: self.state().to_string(),
            });
        };

        let bind_address = self.inner.config.bind_address();
        let addr = match self.inner.gateway.start(&bind_address).await {
            Ok(addr) => addr,
            Err(e) => {
                debug!(error = %e, "bind failed, relay stopped");
                self.inner.shutdown.trigger();
                self.set_state(LifecycleState::Stopped);
                return Err(e);
            }
        };

        let worker = pending.worker.spawn(self.inner.inbound.clone());
        let fan_out = tokio::spawn(pending.fan_out.run(pending.outbound));
        *self.inner.running.lock() = Some(Running { worker, fan_out });

        if self.inner.handle_signals {
            match TerminationSignals::new() {
                Ok(signals) => drop(tokio::spawn(listen_for_signals(self.clone(), signals))),
                Err(e) => warn!(error = %e, "could not install signal handlers"),
            }
        }

        info!(
            %addr,
            fan_out = %self.inner.config.fan_out,
            transform = %self.inner.config.transform,
            "relay running"
        );
        Ok(addr)
    }

    /// Shut the relay down. Idempotent: calls made while already stopping
    /// or stopped return immediately.
    ///
    /// Returns once the relay is `Stopped` (or, for a concurrent call, right
    /// away; use [`wait`](Self::wait) to block until shutdown completes).
    pub async fn stop(&self) {
        let mut from = None;
        let _ = self.inner.state.send_if_modified(|state| {
            let next = match *state {
                LifecycleState::Created => LifecycleState::Stopped,
                LifecycleState::Running => LifecycleState::Stopping,
                LifecycleState::Stopping | LifecycleState::Stopped => return false,
            };
            from = Some(*state);
            *state = next;
            true
        });

        match from {
            None => {
                debug!(state = %self.state(), "stop requested again, ignoring");
                return;
            }
            Some(LifecycleState::Created) => {
                self.inner.shutdown.trigger();
                info!("relay stopped before it was started");
                return;
            }
            Some(_) => {}
        }

        info!("relay stopping");
        self.inner.shutdown.trigger();
        let _ = self.inner.gateway.stop();

        let _transition = self.inner.transition.lock().await;
        let running = self.inner.running.lock().take();
        let aborts = running.as_ref().map(Running::abort_handles);
        let gateway = Arc::clone(&self.inner.gateway);
        let drain = async move {
            if let Some(running) = running {
                if let Some(stats) = running.worker.stop().await {
                    debug!(processed = stats.processed, "worker drained");
                }
                match running.fan_out.await {
                    Ok(dispatched) => debug!(dispatched, "fan-out drained"),
                    Err(e) => warn!(error = %e, "fan-out task failed"),
                }
            }
            let _ = gateway.close_sessions();
            gateway.join().await;
        };

        let timeout = self.inner.config.shutdown_timeout;
        let finished = self.inner.shutdown.drain(drain, timeout).await;
        if !finished {
            let err = RelayError::ShutdownTimeout { timeout };
            warn!(error = %err, "forcing shutdown");
            let forced = self.inner.gateway.force_close();
            for handle in aborts.into_iter().flatten() {
                handle.abort();
            }
            self.inner.timed_out.store(true, Ordering::Release);
            debug!(forced, "remaining work aborted");
        }

        self.set_state(LifecycleState::Stopped);
        info!(forced = !finished, "relay stopped");
    }

    /// Block until the relay is `Stopped`.
    ///
    /// Returns [`RelayError::ShutdownTimeout`] if shutdown had to be forced.
    pub async fn wait(&self) -> Result<(), RelayError> {
        let mut rx = self.inner.state.subscribe();
        loop {
            let stopped = *rx.borrow_and_update() == LifecycleState::Stopped;
            if stopped || rx.changed().await.is_err() {
                break;
            }
        }
        if self.inner.timed_out.load(Ordering::Acquire) {
            Err(RelayError::ShutdownTimeout {
                timeout: self.inner.config.shutdown_timeout,
            })
        } else {
            Ok(())
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    /// Subscribe to lifecycle state changes.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.gateway.local_addr()
    }

    /// Configuration the relay was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Live counters.
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            sessions: self.inner.gateway.session_count(),
            inbound_depth: self.inner.inbound.depth(),
            dispatched: self.inner.dispatched.load(Ordering::Acquire),
        }
    }

    fn set_state(&self, next: LifecycleState) {
        let _ = self.inner.state.send_replace(next);
    }
}

/// Stop the relay on the first termination signal; later signals while
/// shutdown is in progress are logged and ignored.
async fn listen_for_signals(relay: Relay, mut signals: TerminationSignals) {
    let mut state = relay.subscribe();
    let mut received = 0_u32;
    loop {
        let stopped = *state.borrow_and_update() == LifecycleState::Stopped;
        if stopped {
            break;
        }
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            signal = signals.recv() => {
                received += 1;
                if received == 1 {
                    info!(signal, "termination requested, stopping relay");
                    let relay = relay.clone();
                    drop(tokio::spawn(async move { relay.stop().await }));
                } else {
                    warn!(signal, received, "shutdown already in progress, ignoring signal");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn config() -> ServerConfig {
        ServerConfig {
            port: 0,
            shutdown_timeout: Duration::from_secs(5),
            ..ServerConfig::default()
        }
    }

    fn relay() -> Relay {
        Relay::builder(config()).handle_signals(false).build()
    }

    #[test]
    fn state_display_matches_serde() {
        for state in [
            LifecycleState::Created,
            LifecycleState::Running,
            LifecycleState::Stopping,
            LifecycleState::Stopped,
        ] {
            let json = serde_json::to_value(state).unwrap();
            assert_eq!(json, state.to_string());
        }
    }

    #[tokio::test]
    async fn new_relay_is_created() {
        let relay = relay();
        assert_eq!(relay.state(), LifecycleState::Created);
        assert!(relay.local_addr().is_none());
        assert_eq!(relay.stats().sessions, 0);
    }

    #[tokio::test]
    async fn start_then_stop() {
        let relay = relay();
        let addr = relay.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(relay.state(), LifecycleState::Running);
        assert_eq!(relay.local_addr(), Some(addr));

        relay.stop().await;
        assert_eq!(relay.state(), LifecycleState::Stopped);
        relay.wait().await.unwrap();
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let relay = relay();
        let _ = relay.start().await.unwrap();
        assert_matches!(
            relay.start().await,
            Err(RelayError::InvalidState { action: "start", .. })
        );
        relay.stop().await;
    }

    #[tokio::test]
    async fn stop_before_start_goes_straight_to_stopped() {
        let relay = relay();
        relay.stop().await;
        assert_eq!(relay.state(), LifecycleState::Stopped);
        relay.wait().await.unwrap();
        assert_matches!(relay.start().await, Err(RelayError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let relay = relay();
        let _ = relay.start().await.unwrap();
        relay.stop().await;
        relay.stop().await;
        assert_eq!(relay.state(), LifecycleState::Stopped);
        relay.wait().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_stops_complete() {
        let relay = relay();
        let _ = relay.start().await.unwrap();
        let (a, b) = (relay.clone(), relay.clone());
        let _ = tokio::join!(a.stop(), b.stop());
        tokio::time::timeout(Duration::from_secs(5), relay.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relay.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn bind_failure_leaves_relay_stopped() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let relay = Relay::builder(ServerConfig {
            port,
            ..config()
        })
        .handle_signals(false)
        .build();

        let err = relay.start().await.unwrap_err();
        assert_matches!(err, RelayError::Bind { .. });
        assert!(err.is_operator_visible());
        assert_eq!(relay.state(), LifecycleState::Stopped);
        relay.wait().await.unwrap();
    }

    #[tokio::test]
    async fn zero_heartbeat_interval_is_rejected_before_binding() {
        let relay = Relay::builder(ServerConfig {
            heartbeat_interval: Duration::ZERO,
            ..config()
        })
        .handle_signals(false)
        .build();

        assert_matches!(relay.start().await, Err(RelayError::InvalidConfig(_)));
        assert_eq!(relay.state(), LifecycleState::Created);
        assert!(relay.local_addr().is_none());
    }

    #[tokio::test]
    async fn wait_observes_stop_from_another_task() {
        let relay = relay();
        let _ = relay.start().await.unwrap();
        let waiter = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.wait().await })
        };
        relay.stop().await;
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn signal_listener_exits_once_stopped() {
        let relay = Relay::new(config());
        let _ = relay.start().await.unwrap();
        relay.stop().await;
        assert_eq!(relay.state(), LifecycleState::Stopped);
    }
}
