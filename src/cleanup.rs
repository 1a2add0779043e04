//! Crash cleanup.
//!
//! Releases everything a presumed-dead client holds: its locks on every
//! resource, its queued lock requests and its monitor registrations. Cleanup
//! is best effort; a failure on one resource is logged and counted, and the
//! remaining resources are still processed. Running it again for a client
//! that holds nothing is a no-op.

use crate::error::Result;
use crate::lock::{LockRange, ReleaseOutcome};
use crate::observability;
use crate::registry::ClientRegistry;
use crate::types::{ClientId, ResourceId};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Lock-side operations needed by cleanup.
pub trait ClientLockRelease: Send + Sync {
    /// Resources on which the client currently holds locks.
    fn resources_held_by(&self, client: &ClientId) -> Vec<ResourceId>;

    /// Release all of the client's locks on one resource and grant any
    /// waiters that become compatible.
    fn release_client_on(&self, client: &ClientId, resource: &ResourceId) -> Result<ReleaseOutcome>;

    /// Drop every queued request of the client. Returns how many were dropped.
    fn drop_client_waiters(&self, client: &ClientId) -> usize;
}

/// What triggered a cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CleanupReason {
    /// Restart notification could not be delivered.
    NotificationFailed,
    /// Operator asked for it.
    Administrative,
    /// The client announced its own restart.
    PeerRestarted { epoch: u64 },
}

impl CleanupReason {
    fn as_str(&self) -> &'static str {
        match self {
            CleanupReason::NotificationFailed => "notification_failed",
            CleanupReason::Administrative => "administrative",
            CleanupReason::PeerRestarted { .. } => "peer_restarted",
        }
    }
}

impl fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of cleaning up one client.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub client: ClientId,
    pub reason: CleanupReason,
    /// Resources that were processed.
    pub resources: usize,
    /// Lock entries removed.
    pub locks_released: usize,
    /// Queued requests of the client that were dropped.
    pub waiters_dropped: usize,
    /// Other owners' queued requests granted as a result.
    pub waiters_granted: Vec<LockRange>,
    /// Registrations deleted.
    pub registrations_removed: usize,
    /// Resources whose release failed.
    pub failures: usize,
}

impl CleanupReport {
    fn new(client: ClientId, reason: CleanupReason) -> Self {
        Self {
            client,
            reason,
            resources: 0,
            locks_released: 0,
            waiters_dropped: 0,
            waiters_granted: Vec::new(),
            registrations_removed: 0,
            failures: 0,
        }
    }

    /// Whether cleanup found nothing to do.
    pub fn is_noop(&self) -> bool {
        self.locks_released == 0
            && self.waiters_dropped == 0
            && self.registrations_removed == 0
            && self.failures == 0
    }

    /// Whether every resource was released.
    pub fn is_complete(&self) -> bool {
        self.failures == 0
    }
}

/// Crash cleanup coordinator.
pub struct CrashCleanup {
    locks: Arc<dyn ClientLockRelease>,
    registry: Arc<ClientRegistry>,
}

impl CrashCleanup {
    /// Create a new cleanup coordinator.
    pub fn new(locks: Arc<dyn ClientLockRelease>, registry: Arc<ClientRegistry>) -> Self {
        Self { locks, registry }
    }

    /// Release all state held by `client`.
    pub fn cleanup_client(&self, client: &ClientId, reason: CleanupReason) -> CleanupReport {
        let mut report = CleanupReport::new(client.clone(), reason);

        for resource in self.locks.resources_held_by(client) {
            report.resources += 1;
            match self.locks.release_client_on(client, &resource) {
                Ok(outcome) => {
                    report.locks_released += outcome.released;
                    report.waiters_granted.extend(outcome.granted);
                }
                Err(e) => {
                    report.failures += 1;
                    warn!(
                        client = %client,
                        resource = %resource,
                        error = %e,
                        "Failed to release locks during cleanup"
                    );
                }
            }
        }

        report.waiters_dropped = self.locks.drop_client_waiters(client);
        report.registrations_removed = self.registry.unregister_all(client);

        observability::record_cleanup(reason.as_str(), &report);
        if report.is_noop() {
            return report;
        }
        if report.failures > 0 {
            warn!(
                client = %client,
                reason = %reason,
                failures = report.failures,
                resources = report.resources,
                "Cleanup completed with resource failures"
            );
        } else {
            info!(
                client = %client,
                reason = %reason,
                locks = report.locks_released,
                waiters_dropped = report.waiters_dropped,
                waiters_granted = report.waiters_granted.len(),
                registrations = report.registrations_removed,
                "Cleaned up client state"
            );
        }
        report
    }

    /// Cleanup requested by an operator for host `name`.
    ///
    /// Also removes registrations of other clients that monitor `name`.
    pub fn release_named(&self, name: &str) -> CleanupReport {
        let mut report = self.cleanup_client(&ClientId::new(name), CleanupReason::Administrative);
        report.registrations_removed += self.registry.unregister_monitor_target(name);
        report
    }

    /// Handle a restart announcement from monitored peer `name`.
    ///
    /// Locks held by the peer's previous incarnation are stale.
    pub fn peer_restarted(&self, name: &str, epoch: u64) -> CleanupReport {
        info!(peer = name, epoch, "Peer reported restart");
        let mut report = self.cleanup_client(&ClientId::new(name), CleanupReason::PeerRestarted { epoch });
        report.registrations_removed += self.registry.unregister_monitor_target(name);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WardenError;
    use crate::lock::{ByteSpan, LockTable};
    use crate::registry::{RegistryConfig, StoreBackend};
    use crate::types::{CallbackInfo, LockOwner, OpaqueToken};

    fn registry() -> Arc<ClientRegistry> {
        Arc::new(ClientRegistry::in_memory(
            RegistryConfig {
                max_registrations: 16,
                backend: StoreBackend::Memory,
            },
            1,
        ))
    }

    fn owner(client: &str, handle: u8) -> LockOwner {
        LockOwner::new(ClientId::new(client), vec![handle])
    }

    #[test]
    fn test_cleanup_releases_all_owners_of_client() {
        let table = Arc::new(LockTable::default());
        let registry = registry();
        let cleanup = CrashCleanup::new(table.clone(), registry.clone());

        let f = ResourceId::from("F");
        let g = ResourceId::from("G");
        table.acquire(&owner("C1", 1), &f, ByteSpan::new(0, 10), true).unwrap();
        table.acquire(&owner("C1", 2), &g, ByteSpan::new(0, 10), false).unwrap();
        table.acquire(&owner("C2", 1), &g, ByteSpan::new(0, 10), false).unwrap();
        registry
            .register(ClientId::new("C1"), "server", CallbackInfo::new("a:1"), OpaqueToken::new([0; 16]))
            .unwrap();

        let report = cleanup.cleanup_client(&ClientId::new("C1"), CleanupReason::NotificationFailed);
        assert_eq!(report.resources, 2);
        assert_eq!(report.locks_released, 2);
        assert_eq!(report.registrations_removed, 1);
        assert!(report.is_complete());

        assert!(table.list_locks(&f).is_empty());
        assert_eq!(table.list_locks(&g).len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let table = Arc::new(LockTable::default());
        let cleanup = CrashCleanup::new(table.clone(), registry());
        let f = ResourceId::from("F");
        table.acquire(&owner("C1", 1), &f, ByteSpan::new(0, 0), true).unwrap();

        let first = cleanup.cleanup_client(&ClientId::new("C1"), CleanupReason::Administrative);
        assert!(!first.is_noop());
        let second = cleanup.cleanup_client(&ClientId::new("C1"), CleanupReason::Administrative);
        assert!(second.is_noop());
    }

    #[tokio::test]
    async fn test_cleanup_grants_waiters() {
        let table = Arc::new(LockTable::default());
        let cleanup = CrashCleanup::new(table.clone(), registry());
        let f = ResourceId::from("F");
        table.acquire(&owner("C1", 1), &f, ByteSpan::new(0, 100), true).unwrap();

        let handle = match table
            .acquire_or_enqueue(&owner("C2", 1), &f, ByteSpan::new(10, 10), true)
            .unwrap()
        {
            crate::lock::Acquisition::Queued(handle) => handle,
            crate::lock::Acquisition::Granted(_) => panic!("expected queue"),
        };

        let report = cleanup.cleanup_client(&ClientId::new("C1"), CleanupReason::NotificationFailed);
        assert_eq!(report.waiters_granted.len(), 1);
        assert_eq!(handle.granted().await.unwrap().owner, owner("C2", 1));
    }

    /// Releaser that fails on one named resource.
    struct FlakyRelease {
        inner: LockTable,
        broken: ResourceId,
    }

    impl ClientLockRelease for FlakyRelease {
        fn resources_held_by(&self, client: &ClientId) -> Vec<ResourceId> {
            self.inner.resources_held_by(client)
        }

        fn release_client_on(&self, client: &ClientId, resource: &ResourceId) -> Result<ReleaseOutcome> {
            if *resource == self.broken {
                return Err(WardenError::Internal("simulated failure".into()));
            }
            self.inner.release_client_on(client, resource)
        }

        fn drop_client_waiters(&self, client: &ClientId) -> usize {
            self.inner.drop_client_waiters(client)
        }
    }

    #[test]
    fn test_partial_failure_continues() {
        let inner = LockTable::default();
        for name in ["A", "B", "C"] {
            inner
                .acquire(&owner("C1", 1), &ResourceId::from(name), ByteSpan::new(0, 1), true)
                .unwrap();
        }
        let flaky = Arc::new(FlakyRelease {
            inner,
            broken: ResourceId::from("B"),
        });
        let cleanup = CrashCleanup::new(flaky.clone(), registry());

        let report = cleanup.cleanup_client(&ClientId::new("C1"), CleanupReason::NotificationFailed);
        assert_eq!(report.resources, 3);
        assert_eq!(report.failures, 1);
        assert_eq!(report.locks_released, 2);
        assert_eq!(flaky.inner.client_lock_count(&ClientId::new("C1")), 1);
    }

    #[test]
    fn test_release_named_drops_monitor_registrations() {
        let table = Arc::new(LockTable::default());
        let registry = registry();
        let cleanup = CrashCleanup::new(table, registry.clone());
        registry
            .register(ClientId::new("C2"), "hostX", CallbackInfo::new("a:1"), OpaqueToken::new([0; 16]))
            .unwrap();
        registry
            .register(ClientId::new("hostX"), "server", CallbackInfo::new("b:1"), OpaqueToken::new([0; 16]))
            .unwrap();

        let report = cleanup.release_named("hostX");
        assert_eq!(report.registrations_removed, 2);
        assert!(registry.is_empty());
    }
}
