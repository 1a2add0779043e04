//! Administrative entry point.
//!
//! Commands arrive already decoded; the transport that carries them (HTTP,
//! a local socket, a CLI) is outside this crate.

use crate::cleanup::{CleanupReport, CrashCleanup};
use crate::grace::GracePeriod;
use crate::lock::{LockRange, LockTable, LockTableStats};
use crate::registry::ClientRegistry;
use crate::types::ClientId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Administrative command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum AdminCommand {
    /// Release every lock and registration of host `name`.
    ReleaseClient { name: String },
    /// Host `name` announced a restart with a new epoch.
    PeerRestarted { name: String, epoch: u64 },
    /// List registered clients.
    ListClients,
    /// Locks currently held by host `name`, across all its owner handles.
    ClientLocks { name: String },
    /// Lock table statistics.
    LockStats,
    /// Grace period state.
    GraceStatus,
}

/// One registered client as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSummary {
    pub client_id: String,
    pub monitor_target: String,
    pub callback: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub locks_held: usize,
}

/// Reply to an administrative command.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AdminResponse {
    Released(CleanupReport),
    Clients { clients: Vec<ClientSummary> },
    Locks { client: String, locks: Vec<LockRange> },
    LockStats(LockTableStats),
    Grace { active: bool, remaining_ms: u64 },
}

/// Executes administrative commands.
pub struct AdminHandler {
    cleanup: Arc<CrashCleanup>,
    registry: Arc<ClientRegistry>,
    table: Arc<LockTable>,
    grace: Arc<GracePeriod>,
}

impl AdminHandler {
    /// Create a new handler.
    pub fn new(
        cleanup: Arc<CrashCleanup>,
        registry: Arc<ClientRegistry>,
        table: Arc<LockTable>,
        grace: Arc<GracePeriod>,
    ) -> Self {
        Self {
            cleanup,
            registry,
            table,
            grace,
        }
    }

    /// Run one command.
    pub fn handle(&self, command: AdminCommand) -> AdminResponse {
        match command {
            AdminCommand::ReleaseClient { name } => {
                info!(client = %name, "Administrative release requested");
                AdminResponse::Released(self.cleanup.release_named(&name))
            }
            AdminCommand::PeerRestarted { name, epoch } => {
                AdminResponse::Released(self.cleanup.peer_restarted(&name, epoch))
            }
            AdminCommand::ListClients => {
                let mut clients: Vec<ClientSummary> = self
                    .registry
                    .list()
                    .into_iter()
                    .map(|reg| ClientSummary {
                        locks_held: self.table.client_lock_count(&reg.client_id),
                        client_id: reg.client_id.to_string(),
                        monitor_target: reg.monitor_target,
                        callback: reg.callback.address,
                        registered_at: reg.registered_at,
                        last_seen: reg.last_seen,
                    })
                    .collect();
                clients.sort_by(|a, b| {
                    (&a.client_id, &a.monitor_target).cmp(&(&b.client_id, &b.monitor_target))
                });
                AdminResponse::Clients { clients }
            }
            AdminCommand::ClientLocks { name } => {
                let mut locks = self.table.locks_for_client(&ClientId::new(name.clone()));
                locks.sort_by(|a, b| {
                    (a.resource.as_bytes(), a.offset).cmp(&(b.resource.as_bytes(), b.offset))
                });
                AdminResponse::Locks { client: name, locks }
            }
            AdminCommand::LockStats => AdminResponse::LockStats(self.table.stats()),
            AdminCommand::GraceStatus => AdminResponse::Grace {
                active: self.grace.is_active(),
                remaining_ms: self.grace.remaining().as_millis() as u64,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::ByteSpan;
    use crate::registry::{RegistryConfig, StoreBackend};
    use crate::types::{CallbackInfo, LockOwner, OpaqueToken, ResourceId};

    fn handler() -> (AdminHandler, Arc<LockTable>, Arc<ClientRegistry>) {
        let table = Arc::new(LockTable::default());
        let registry = Arc::new(ClientRegistry::in_memory(
            RegistryConfig {
                max_registrations: 16,
                backend: StoreBackend::Memory,
            },
            3,
        ));
        let cleanup = Arc::new(CrashCleanup::new(table.clone(), registry.clone()));
        let handler = AdminHandler::new(
            cleanup,
            registry.clone(),
            table.clone(),
            Arc::new(GracePeriod::inactive()),
        );
        (handler, table, registry)
    }

    #[test]
    fn test_release_client() {
        let (handler, table, registry) = handler();
        let file = ResourceId::from("F");
        let owner = LockOwner::new(ClientId::new("hostX"), vec![1]);
        table.acquire(&owner, &file, ByteSpan::new(0, 10), true).unwrap();
        registry
            .register(ClientId::new("hostX"), "srv", CallbackInfo::new("x:1"), OpaqueToken::new([1; 16]))
            .unwrap();

        let response = handler.handle(AdminCommand::ReleaseClient { name: "hostX".into() });
        match response {
            AdminResponse::Released(report) => {
                assert_eq!(report.locks_released, 1);
                assert_eq!(report.registrations_removed, 1);
            }
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(table.lock_count(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_clients_shows_lock_counts() {
        let (handler, table, registry) = handler();
        registry
            .register(ClientId::new("b"), "srv", CallbackInfo::new("b:1"), OpaqueToken::new([1; 16]))
            .unwrap();
        registry
            .register(ClientId::new("a"), "srv", CallbackInfo::new("a:1"), OpaqueToken::new([1; 16]))
            .unwrap();
        let owner = LockOwner::new(ClientId::new("a"), vec![1]);
        table
            .acquire(&owner, &ResourceId::from("F"), ByteSpan::new(0, 1), false)
            .unwrap();

        match handler.handle(AdminCommand::ListClients) {
            AdminResponse::Clients { clients } => {
                assert_eq!(clients.len(), 2);
                assert_eq!(clients[0].client_id, "a");
                assert_eq!(clients[0].locks_held, 1);
                assert_eq!(clients[1].locks_held, 0);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_client_locks() {
        let (handler, table, _) = handler();
        let first = LockOwner::new(ClientId::new("hostX"), vec![1]);
        let second = LockOwner::new(ClientId::new("hostX"), vec![2]);
        table.acquire(&first, &ResourceId::from("G"), ByteSpan::new(0, 0), false).unwrap();
        table.acquire(&second, &ResourceId::from("F"), ByteSpan::new(50, 5), true).unwrap();
        table.acquire(&first, &ResourceId::from("F"), ByteSpan::new(0, 5), true).unwrap();
        table
            .acquire(&LockOwner::new(ClientId::new("hostY"), vec![1]), &ResourceId::from("H"), ByteSpan::new(0, 1), true)
            .unwrap();

        match handler.handle(AdminCommand::ClientLocks { name: "hostX".into() }) {
            AdminResponse::Locks { client, locks } => {
                assert_eq!(client, "hostX");
                let seen: Vec<_> = locks.iter().map(|l| (l.resource.clone(), l.offset)).collect();
                assert_eq!(
                    seen,
                    vec![
                        (ResourceId::from("F"), 0),
                        (ResourceId::from("F"), 50),
                        (ResourceId::from("G"), 0),
                    ]
                );
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_command_decoding() {
        let cmd: AdminCommand =
            serde_json::from_str(r#"{"command":"release_client","name":"hostX"}"#).unwrap();
        assert_eq!(cmd, AdminCommand::ReleaseClient { name: "hostX".into() });

        let json = serde_json::to_value(handler().0.handle(AdminCommand::LockStats)).unwrap();
        assert_eq!(json["result"], "lock_stats");
    }
}
