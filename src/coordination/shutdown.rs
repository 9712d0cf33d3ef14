//! Graceful Shutdown Handler
//!
//! One `GracefulShutdown` per process fans a stop request out to every
//! long-running task through cheap, cloneable [`ShutdownListener`]s. The
//! consumer stops pulling, lets in-flight deliveries reach their broker
//! decision and returns; anything unacked stays with the broker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM, SIGINT
    Graceful,
    /// Second signal while draining: skip the drain
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    requested: AtomicBool,
    signal_tx: watch::Sender<Option<ShutdownSignal>>,
    drain_timeout: Duration,
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl GracefulShutdown {
    pub fn new(drain_timeout: Duration) -> Self {
        let (signal_tx, _) = watch::channel(None);
        Self {
            requested: AtomicBool::new(false),
            signal_tx,
            drain_timeout,
        }
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.signal_tx.subscribe(),
            _sender: None,
        }
    }

    pub fn signal(&self) -> Option<ShutdownSignal> {
        *self.signal_tx.borrow()
    }

    /// Request shutdown. A repeated request escalates to [`ShutdownSignal::Urgent`].
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        let signal = if self.requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, escalating");
            ShutdownSignal::Urgent
        } else {
            signal
        };

        info!("Shutdown requested: {}", signal);
        self.signal_tx.send_replace(Some(signal));
    }

    /// Await `drain`, giving up after the drain timeout or on an urgent signal.
    ///
    /// Returns `true` if the drain finished.
    pub async fn drain<F>(&self, drain: F) -> bool
    where
        F: std::future::Future<Output = ()>,
    {
        let mut listener = self.listener();
        tokio::select! {
            result = tokio::time::timeout(self.drain_timeout, drain) => match result {
                Ok(()) => true,
                Err(_) => {
                    warn!("Drain timeout after {:?}, proceeding anyway", self.drain_timeout);
                    false
                }
            },
            _ = listener.wait_urgent() => {
                warn!("Urgent shutdown, abandoning drain");
                false
            }
        }
    }
}

/// Cloneable view of the shutdown state for async tasks
#[derive(Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<Option<ShutdownSignal>>,
    // Held only by `never()` listeners, which own their sender
    _sender: Option<Arc<watch::Sender<Option<ShutdownSignal>>>>,
}

impl ShutdownListener {
    /// A listener that never fires; for one-shot commands and tests.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            rx,
            _sender: Some(Arc::new(tx)),
        }
    }

    pub fn is_requested(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Resolve once shutdown is requested (immediately if it already was).
    pub async fn wait(&mut self) {
        while self.rx.borrow_and_update().is_none() {
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    async fn wait_urgent(&mut self) {
        while *self.rx.borrow_and_update() != Some(ShutdownSignal::Urgent) {
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Install SIGINT/SIGTERM handlers that request shutdown
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    let on_ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received SIGINT");
            on_ctrl_c.request_shutdown(ShutdownSignal::Graceful);
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        tokio::spawn(async move {
            let mut stream = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    return;
                }
            };
            while stream.recv().await.is_some() {
                info!("Received SIGTERM");
                shutdown.request_shutdown(ShutdownSignal::Graceful);
            }
        });
    }
}
