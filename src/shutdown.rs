//! Graceful shutdown coordination
//!
//! On SIGINT/SIGTERM the coordinator flips into the shutdown state, the HTTP
//! server stops accepting connections, and in-flight requests get up to
//! `in_flight_timeout` to finish before the process exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// How long in-flight requests may run after shutdown starts
    pub in_flight_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            in_flight_timeout: Duration::from_secs(30),
        }
    }
}

impl ShutdownConfig {
    pub fn with_in_flight_timeout(mut self, timeout: Duration) -> Self {
        self.in_flight_timeout = timeout;
        self
    }
}

pub struct ShutdownCoordinator {
    config: ShutdownConfig,
    shutdown_token: CancellationToken,
    /// Signalled when the last in-flight request finishes.
    drained: Notify,
    active_requests: AtomicU64,
}

impl ShutdownCoordinator {
    pub fn new(config: ShutdownConfig) -> Self {
        Self {
            config,
            shutdown_token: CancellationToken::new(),
            drained: Notify::new(),
            active_requests: AtomicU64::new(0),
        }
    }

    /// Cancelled once shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn config(&self) -> &ShutdownConfig {
        &self.config
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Starts shutdown. Idempotent.
    pub fn trigger(&self) {
        self.shutdown_token.cancel();
    }

    /// Resolves once shutdown has started.
    pub async fn initiated(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// Waits for SIGINT or SIGTERM, then triggers shutdown.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(err) => {
                    error!(error = %err, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT (Ctrl+C), initiating graceful shutdown"),
            _ = terminate => info!("received SIGTERM, initiating graceful shutdown"),
            _ = self.initiated() => info!("shutdown requested"),
        }
        self.trigger();
    }

    pub fn active_request_count(&self) -> u64 {
        self.active_requests.load(Ordering::SeqCst)
    }

    /// Counts a request as in flight until the guard drops.
    pub fn track_request(self: &Arc<Self>) -> InFlightGuard {
        self.active_requests.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            coordinator: Arc::clone(self),
        }
    }

    /// Waits until no request is in flight. Returns `false` when the
    /// in-flight timeout elapsed first.
    pub async fn wait_for_drain(&self) -> bool {
        let deadline = sleep(self.config.in_flight_timeout);
        tokio::pin!(deadline);
        loop {
            // registered before the count is read so a finish in between still wakes us
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let active = self.active_request_count();
            if active == 0 {
                info!("all in-flight requests completed");
                return true;
            }
            debug!(active_requests = active, "waiting for requests to complete");
            tokio::select! {
                _ = &mut notified => {}
                _ = &mut deadline => {
                    warn!(
                        remaining_requests = self.active_request_count(),
                        "in-flight timeout reached, exiting with active requests"
                    );
                    return false;
                }
            }
        }
    }
}

pub struct InFlightGuard {
    coordinator: Arc<ShutdownCoordinator>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.coordinator.active_requests.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.coordinator.drained.notify_waiters();
        }
    }
}
