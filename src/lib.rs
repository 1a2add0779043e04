//! Warden - byte-range lock manager with crash recovery.
//!
//! Warden is the locking core of a network file server. It arbitrates
//! byte-range locks between clients, remembers which clients want to hear
//! about server restarts, tells them when one happens, and gives them a
//! grace period to reclaim their locks before new requests are admitted.
//!
//! # Features
//!
//! - **Byte-range locks**: shared/exclusive ranges with POSIX unlock semantics
//!   and FIFO blocking waiters.
//! - **Client registry**: durable monitor registrations (file or RocksDB).
//! - **Restart notification**: parallel callbacks carrying the new epoch.
//! - **Grace period**: only reclaims are admitted right after a restart.
//! - **Crash cleanup**: unreachable clients lose their locks and registrations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Warden                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Front-ends (NLM, NFSv4, SMB): decoded LockRequest values    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  LockService: grace gating  |  AdminHandler                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  LockTable  |  ClientRegistry  |  CrashNotifier  | Cleanup   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Persistence: epoch file | registration store                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use warden::config::WardenConfig;
//!
//! #[tokio::main]
//! async fn main() -> warden::Result<()> {
//!     let config = WardenConfig::development();
//!     warden::run(config).await
//! }
//! ```

pub mod admin;
pub mod cleanup;
pub mod config;
pub mod epoch;
pub mod error;
pub mod grace;
pub mod lock;
pub mod notify;
pub mod observability;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod types;

// Re-exports
pub use error::{Result, WardenError};
pub use server::{Warden, WardenBuilder};
pub use types::*;

use config::WardenConfig;
use shutdown::{trigger_on_signal, BackgroundTasks, ShutdownSignal, DEFAULT_STOP_TIMEOUT};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Run a Warden server with the given configuration until a shutdown signal.
pub async fn run(config: WardenConfig) -> Result<()> {
    // Initialize observability
    observability::init(&config.observability)?;
    info!("Starting Warden node: {}", config.node.name);

    std::fs::create_dir_all(&config.storage.state_dir)?;

    let shutdown = ShutdownSignal::new();
    let mut tasks = BackgroundTasks::new();

    if config.observability.metrics_enabled {
        info!("Starting metrics server on {}", config.observability.metrics_addr);
        let obs_config = config.observability.clone();
        let recorder = observability::install_recorder()?;
        let signal = shutdown.clone();
        tasks.spawn("metrics", async move {
            if let Err(e) = observability::run_metrics_server(obs_config, recorder, signal).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let warden = Arc::new(Warden::builder(config).start().await?);

    let report_warden = warden.clone();
    let report_shutdown = shutdown.clone();
    tasks.spawn("recovery-report", async move {
        tokio::select! {
            result = report_warden.recovery_complete() => match result {
                Ok(report) => info!(
                    epoch = report.epoch,
                    delivered = report.delivered,
                    failed = report.failed.len(),
                    "Restart recovery finished"
                ),
                Err(e) => error!("Restart notification error: {}", e),
            },
            _ = report_shutdown.wait() => {}
        }
    });

    trigger_on_signal(shutdown.clone()).await;
    info!("Shutting down Warden gracefully...");

    warden.shutdown();
    let aborted = tasks.stop(DEFAULT_STOP_TIMEOUT).await;
    if aborted > 0 {
        warn!(aborted, "Background tasks did not stop in time");
    }

    info!("Warden shutdown complete");
    Ok(())
}
