//! Graceful Shutdown
//!
//! One controller per process. Listeners subscribe to it, every query in
//! flight holds a guard, and `main` waits for the guards to drop before
//! tearing the upstream transports down.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

#[derive(Clone)]
pub struct ShutdownController {
    inner: Arc<Inner>,
    shutdown_tx: broadcast::Sender<()>,
}

struct Inner {
    initiated: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                initiated: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
            shutdown_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Tell every subscriber to stop. Only the first call does anything.
    pub fn shutdown(&self) {
        if !self.inner.initiated.swap(true, Ordering::SeqCst) {
            tracing::info!("shutting down");
            let _ = self.shutdown_tx.send(());
            if self.in_flight() == 0 {
                self.inner.drained.notify_waiters();
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.initiated.load(Ordering::SeqCst)
    }

    /// Queries currently being answered.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Track one query until the guard is dropped.
    pub fn query_guard(&self) -> QueryGuard {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        QueryGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Wait until no query is in flight, at most `timeout`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let notified = self.inner.drained.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.in_flight() == 0 {
            return true;
        }

        tokio::select! {
            _ = notified => true,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!("drain timed out with {} queries in flight", self.in_flight());
                false
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Held while a query is being answered.
pub struct QueryGuard {
    inner: Arc<Inner>,
}

impl Drop for QueryGuard {
    fn drop(&mut self) {
        let prev = self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

/// Resolve on Ctrl+C or SIGTERM, then trigger `controller`.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn shutdown_signal(controller: ShutdownController) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }

    controller.shutdown();
}
