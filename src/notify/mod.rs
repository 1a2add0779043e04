//! Restart notification.
//!
//! After a restart every registered client is told the new epoch so it can
//! reclaim its locks during the grace period. All deliveries of a round run
//! in parallel; a client that cannot be reached is presumed dead and its
//! state is cleaned up as soon as its delivery fails.

mod transport;

pub use transport::{CallbackTransport, NotificationAck, StateChangeNotification, TcpCallbackTransport};

use crate::cleanup::{CleanupReason, CrashCleanup};
use crate::error::{Result, WardenError};
use crate::observability;
use crate::registry::{ClientRegistration, ClientRegistry};
use crate::types::ClientId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Notifier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Per-client delivery timeout.
    #[serde(with = "crate::config::humantime_serde")]
    pub timeout: Duration,
    /// Name this server announces itself as.
    pub server_name: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            server_name: "localhost".to_string(),
        }
    }
}

/// Notifier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierState {
    Idle,
    NotifyingAll,
}

/// Result of a notification round.
#[derive(Debug, Clone)]
pub struct NotifyReport {
    /// Epoch that was announced.
    pub epoch: u64,
    /// Deliveries attempted.
    pub attempted: usize,
    /// Deliveries acknowledged.
    pub delivered: usize,
    /// Clients whose delivery failed and were cleaned up.
    pub failed: Vec<ClientId>,
    /// Wall time of the round.
    pub elapsed: Duration,
}

/// Restart notifier.
pub struct CrashNotifier {
    config: NotifierConfig,
    registry: Arc<ClientRegistry>,
    cleanup: Arc<CrashCleanup>,
    transport: Arc<dyn CallbackTransport>,
    state: Mutex<NotifierState>,
}

impl CrashNotifier {
    /// Create a new notifier.
    pub fn new(
        config: NotifierConfig,
        registry: Arc<ClientRegistry>,
        cleanup: Arc<CrashCleanup>,
        transport: Arc<dyn CallbackTransport>,
    ) -> Self {
        Self {
            config,
            registry,
            cleanup,
            transport,
            state: Mutex::new(NotifierState::Idle),
        }
    }

    /// Current state.
    pub fn state(&self) -> NotifierState {
        *self.state.lock()
    }

    /// Notify every registered client of `epoch`.
    ///
    /// Returns once every delivery has succeeded or failed. A second call
    /// while a round is running is rejected.
    ///
    /// Dropping the returned future mid-round aborts outstanding deliveries
    /// and returns the notifier to idle.
    pub async fn notify_all(&self, epoch: u64) -> Result<NotifyReport> {
        let _round = RoundGuard::enter(&self.state)?;
        Ok(self.run_round(epoch).await)
    }

    async fn run_round(&self, epoch: u64) -> NotifyReport {
        let round = Uuid::new_v4();
        let started = Instant::now();
        let registrations = self.registry.list();
        info!(%round, epoch, clients = registrations.len(), "Starting restart notification round");

        let mut tasks = JoinSet::new();
        for registration in &registrations {
            let transport = self.transport.clone();
            let registration = registration.clone();
            let notification = self.notification_for(&registration, epoch);
            let timeout = self.config.timeout;
            tasks.spawn(async move {
                let address = registration.callback.address.clone();
                let result = match tokio::time::timeout(
                    timeout,
                    transport.send_notification(&address, &notification, timeout),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(WardenError::Timeout(timeout.as_millis() as u64)),
                };
                (registration, result)
            });
        }

        let mut delivered = 0;
        let mut failed = Vec::new();
        let mut cleaned: HashSet<ClientId> = HashSet::new();

        while let Some(joined) = tasks.join_next().await {
            let (registration, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(%round, error = %e, "Notification task aborted");
                    continue;
                }
            };

            match result {
                Ok(()) => {
                    delivered += 1;
                    observability::record_notification("delivered");
                    self.registry.touch(&registration.key());
                    debug!(
                        %round,
                        client = %registration.client_id,
                        address = %registration.callback.address,
                        "Delivered restart notification"
                    );
                }
                Err(e) => {
                    observability::record_notification(failure_label(&e));
                    warn!(
                        %round,
                        client = %registration.client_id,
                        address = %registration.callback.address,
                        error = %e,
                        "Restart notification failed, cleaning up client"
                    );
                    if cleaned.insert(registration.client_id.clone()) {
                        self.cleanup
                            .cleanup_client(&registration.client_id, CleanupReason::NotificationFailed);
                        failed.push(registration.client_id);
                    }
                }
            }
        }

        let elapsed = started.elapsed();
        observability::record_notify_round(elapsed);
        info!(
            %round,
            epoch,
            attempted = registrations.len(),
            delivered,
            failed = failed.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Restart notification round finished"
        );

        NotifyReport {
            epoch,
            attempted: registrations.len(),
            delivered,
            failed,
            elapsed,
        }
    }

    fn notification_for(&self, registration: &ClientRegistration, epoch: u64) -> StateChangeNotification {
        StateChangeNotification {
            server_name: self.config.server_name.clone(),
            monitor_target: registration.monitor_target.clone(),
            epoch,
            token: registration.token,
            route: registration.callback.route,
        }
    }
}

/// Marks a round in progress; resets the notifier to idle when dropped.
struct RoundGuard<'a> {
    state: &'a Mutex<NotifierState>,
}

impl<'a> RoundGuard<'a> {
    fn enter(state: &'a Mutex<NotifierState>) -> Result<Self> {
        let mut current = state.lock();
        if *current == NotifierState::NotifyingAll {
            return Err(WardenError::InvalidState(
                "Notification round already in progress".into(),
            ));
        }
        *current = NotifierState::NotifyingAll;
        Ok(Self { state })
    }
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        *self.state.lock() = NotifierState::Idle;
    }
}

fn failure_label(error: &WardenError) -> &'static str {
    match error {
        WardenError::Timeout(_) => "timeout",
        WardenError::MalformedAck(_) => "malformed_ack",
        WardenError::ConnectionFailed(_) => "refused",
        _ => "failed",
    }
}
