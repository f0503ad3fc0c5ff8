//! Graceful shutdown coordination
//!
//! A [`ShutdownSignal`] is cloned into every long-running task (consumers,
//! relay, HTTP server). Tasks finish the unit of work in hand, then exit when
//! the signal fires.
//!
//! ```rust
//! use event_bus::ShutdownSignal;
//!
//! # async fn example() {
//! let shutdown = ShutdownSignal::new();
//! let worker = shutdown.clone();
//! let handle = tokio::spawn(async move {
//!     worker.cancelled().await;
//! });
//! shutdown.trigger();
//! handle.await.unwrap();
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

/// Default grace period for in-flight work after shutdown is triggered.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
    grace_period: Duration,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::with_grace_period(DEFAULT_GRACE_PERIOD)
    }

    pub fn with_grace_period(grace_period: Duration) -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
            grace_period,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once the signal has fired (immediately if it already has).
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives in self, so the channel cannot close while we wait.
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }

    /// Wait for SIGINT or SIGTERM, then fire the signal.
    pub async fn wait_for_os_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
            _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = self.cancelled() => return,
        }

        self.trigger();
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancelled_resolves_after_trigger() {
        let shutdown = ShutdownSignal::new();
        assert!(!shutdown.is_triggered());

        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancelled() should resolve")
            .unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_cancelled_after_trigger_is_immediate() {
        let shutdown = ShutdownSignal::with_grace_period(Duration::from_secs(1));
        shutdown.trigger();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_millis(50), shutdown.cancelled())
            .await
            .expect("already triggered");
        assert_eq!(shutdown.grace_period(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_os_signal_wait_returns_when_triggered_programmatically() {
        let shutdown = ShutdownSignal::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.wait_for_os_signal().await });
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("wait_for_os_signal should return")
            .unwrap();
    }
}
