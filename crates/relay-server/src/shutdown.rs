//! Shutdown signalling via `CancellationToken`, plus OS termination signals.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shared shutdown signal observed by every relay task.
///
/// Once triggered it stays triggered.
#[derive(Clone, Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new, untriggered coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown. Idempotent.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Run `work` to completion or until `timeout` elapses.
    ///
    /// Returns `true` if the work finished in time.
    pub async fn drain<F>(&self, work: F, timeout: Duration) -> bool
    where
        F: Future<Output = ()>,
    {
        info!(timeout_ms = timeout.as_millis(), "draining relay tasks");
        if tokio::time::timeout(timeout, work).await.is_ok() {
            true
        } else {
            warn!("drain did not finish within {timeout:?}");
            false
        }
    }
}

/// Listener for process termination requests (SIGINT and SIGTERM on Unix,
/// Ctrl+C elsewhere).
pub struct TerminationSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl TerminationSignals {
    /// Register the signal handlers. Must be called inside a Tokio runtime.
    #[cfg(unix)]
    pub fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Register the signal handlers. Must be called inside a Tokio runtime.
    #[cfg(not(unix))]
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {})
    }

    /// Wait for the next termination request and return its name.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }

    /// Wait for the next termination request and return its name.
    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> &'static str {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        "ctrl-c"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_not_shutting_down() {
        let coord = ShutdownCoordinator::new();
        assert!(!coord.token().is_cancelled());
    }

    #[test]
    fn trigger_sets_flag_and_is_idempotent() {
        let coord = ShutdownCoordinator::new();
        coord.trigger();
        coord.trigger();
        assert!(coord.token().is_cancelled());
    }

    #[test]
    fn clones_share_the_signal() {
        let coord = ShutdownCoordinator::new();
        let other = coord.clone();
        let token = coord.token();
        other.trigger();
        assert!(coord.token().is_cancelled());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn token_wakes_waiters() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        coord.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn drain_reports_completion() {
        let coord = ShutdownCoordinator::new();
        assert!(coord.drain(async {}, Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_reports_timeout() {
        let coord = ShutdownCoordinator::new();
        let finished = coord
            .drain(std::future::pending::<()>(), Duration::from_millis(100))
            .await;
        assert!(!finished);
    }

    #[tokio::test]
    async fn termination_signals_register() {
        assert!(TerminationSignals::new().is_ok());
    }
}
