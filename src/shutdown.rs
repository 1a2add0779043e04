//! Graceful shutdown.
//!
//! A [`ShutdownSignal`] is tripped once, by an OS signal or by the caller,
//! and every background task of the server (metrics endpoint, recovery
//! report) observes it. [`BackgroundTasks`] then gives those tasks a bounded
//! time to finish before aborting what is left.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long stopped tasks get to finish before they are aborted.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// One-shot shutdown trigger shared by the server's tasks.
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trip the signal. Later calls are no-ops.
    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            info!("Shutdown requested");
        }
    }

    /// Whether the signal has been tripped.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal is tripped.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for SIGTERM, SIGINT or SIGQUIT and trip `shutdown`.
///
/// If the handlers cannot be installed the signal is tripped immediately;
/// a lock manager that cannot be stopped cleanly should not keep running.
#[cfg(unix)]
pub async fn trigger_on_signal(shutdown: ShutdownSignal) {
    use tokio::signal::unix::{signal, SignalKind};

    let installed = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::quit()),
    );
    let (mut sigterm, mut sigint, mut sigquit) = match installed {
        (Ok(term), Ok(int), Ok(quit)) => (term, int, quit),
        (term, int, quit) => {
            let e = term.err().or(int.err()).or(quit.err());
            error!(error = ?e, "Failed to install signal handlers, shutting down");
            shutdown.trigger();
            return;
        }
    };

    let received = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
        _ = sigquit.recv() => "SIGQUIT",
        _ = shutdown.wait() => return,
    };
    info!(signal = received, "Received shutdown signal");
    shutdown.trigger();
}

/// Wait for Ctrl+C and trip `shutdown`.
#[cfg(windows)]
pub async fn trigger_on_signal(shutdown: ShutdownSignal) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to install Ctrl+C handler");
            } else {
                info!("Received Ctrl+C");
            }
        }
        _ = shutdown.wait() => return,
    }
    shutdown.trigger();
}

/// Named background tasks of a running server.
#[derive(Default)]
pub struct BackgroundTasks {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task under `name`.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "Spawned background task");
        self.tasks.push((name, tokio::spawn(task)));
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task was spawned.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task, newest first, until `timeout` has passed in
    /// total; abort the ones still running. Returns how many were aborted.
    pub async fn stop(self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut aborted = 0;
        for (name, mut handle) in self.tasks.into_iter().rev() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "Background task finished"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Background task failed"),
                Err(_) => {
                    warn!(task = name, "Force aborting background task");
                    handle.abort();
                    aborted += 1;
                }
            }
        }
        aborted
    }
}
