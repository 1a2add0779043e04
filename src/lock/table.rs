//! Byte-range lock table.
//!
//! All state lives behind a single write guard so that conflict evaluation
//! and mutation happen atomically: two callers can never both observe a
//! conflict-free table and both acquire mutually conflicting ranges.
//! Releasing a lock and granting the waiters it unblocks happen inside the
//! same guarded section.

use super::range::{ByteSpan, LockConflict, LockRange};
use super::waiter::{Waiter, WaiterHandle, WaiterQueue};
use crate::cleanup::ClientLockRelease;
use crate::error::{Result, WardenError};
use crate::observability;
use crate::types::{ClientId, LockOwner, ResourceId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Lock table configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Maximum locks a single client may hold across all resources.
    pub max_locks_per_client: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_locks_per_client: 10_000,
        }
    }
}

/// Why an acquisition was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    /// An incompatible lock is held by another owner.
    #[error("range is locked by {}", .0.owner)]
    Conflict(LockConflict),
    /// The client reached its lock limit.
    #[error("client {client} already holds {limit} locks")]
    TooManyLocks { client: ClientId, limit: usize },
}

/// Result of an acquisition that may queue.
#[derive(Debug)]
pub enum Acquisition {
    /// The lock was granted immediately.
    Granted(LockRange),
    /// The request conflicts and was queued.
    Queued(WaiterHandle),
}

/// Effect of a release.
#[derive(Debug, Clone, Default)]
pub struct ReleaseOutcome {
    /// Lock entries removed or trimmed.
    pub released: usize,
    /// Waiters granted as a consequence, in grant order.
    pub granted: Vec<LockRange>,
}

impl ReleaseOutcome {
    fn merge(&mut self, other: ReleaseOutcome) {
        self.released += other.released;
        self.granted.extend(other.granted);
    }
}

/// Entries an acquisition installs for its owner.
#[derive(Debug)]
struct Placement {
    /// Span that was requested.
    request: ByteSpan,
    /// Entry covering the request in the requested mode.
    lock: LockRange,
    /// Pieces of other-mode entries left outside the request.
    remainder: Vec<LockRange>,
}

/// Locks and waiters of one resource.
#[derive(Debug, Default)]
struct ResourceLocks {
    locks: Vec<LockRange>,
    waiters: WaiterQueue,
}

impl ResourceLocks {
    fn is_idle(&self) -> bool {
        self.locks.is_empty() && self.waiters.is_empty()
    }

    fn first_conflict(&self, owner: &LockOwner, span: &ByteSpan, exclusive: bool) -> Option<&LockRange> {
        self.locks.iter().find(|l| l.blocks(owner, span, exclusive))
    }

    fn merges_with(&self, owner: &LockOwner, span: &ByteSpan) -> bool {
        self.locks
            .iter()
            .any(|l| l.owner == *owner && l.span().overlaps(span))
    }

    /// Work out what a request would install without changing anything.
    ///
    /// Conflicts are evaluated for the requested span only. The owner's
    /// entries overlapping the request are absorbed when they have the
    /// requested mode; entries of the other mode are split around the
    /// request and keep their mode outside it.
    fn plan(
        &self,
        owner: &LockOwner,
        resource: &ResourceId,
        span: ByteSpan,
        exclusive: bool,
    ) -> std::result::Result<Placement, LockConflict> {
        if let Some(conflict) = self.first_conflict(owner, &span, exclusive) {
            return Err(conflict.as_conflict());
        }

        let mut merged = span;
        let mut acquired_at: Option<DateTime<Utc>> = None;
        let mut remainder = Vec::new();
        for held in self
            .locks
            .iter()
            .filter(|l| l.owner == *owner && l.span().overlaps(&span))
        {
            if held.exclusive == exclusive {
                merged = merged.union(&held.span());
                acquired_at = Some(match acquired_at {
                    Some(at) => at.min(held.acquired_at),
                    None => held.acquired_at,
                });
            } else {
                remainder.extend(held.span().subtract(&span).into_iter().map(|piece| LockRange {
                    offset: piece.offset,
                    length: piece.length,
                    ..held.clone()
                }));
            }
        }

        let mut lock = LockRange::new(owner.clone(), resource.clone(), merged, exclusive);
        if let Some(at) = acquired_at {
            lock.acquired_at = at;
        }
        Ok(Placement {
            request: span,
            lock,
            remainder,
        })
    }

    /// Install a planned placement, replacing the owner's entries it covers.
    fn commit(&mut self, placement: Placement) -> LockRange {
        let Placement {
            request,
            lock,
            remainder,
        } = placement;
        self.locks
            .retain(|l| !(l.owner == lock.owner && l.span().overlaps(&request)));
        self.locks.extend(remainder);
        self.locks.push(lock.clone());
        lock
    }

    /// Trim or split the owner's entries overlapping `span`.
    fn unlock(&mut self, owner: &LockOwner, span: &ByteSpan) -> usize {
        let mut affected = 0;
        let mut kept = Vec::with_capacity(self.locks.len() + 1);
        for lock in self.locks.drain(..) {
            if lock.owner == *owner && lock.span().overlaps(span) {
                affected += 1;
                for piece in lock.span().subtract(span) {
                    kept.push(LockRange {
                        offset: piece.offset,
                        length: piece.length,
                        ..lock.clone()
                    });
                }
            } else {
                kept.push(lock);
            }
        }
        self.locks = kept;
        affected
    }

    fn remove_locks(&mut self, mut matches: impl FnMut(&LockRange) -> bool) -> usize {
        let before = self.locks.len();
        self.locks.retain(|l| !matches(l));
        before - self.locks.len()
    }

    /// Grant queued waiters that no longer conflict, in arrival order.
    ///
    /// A waiter is skipped while it conflicts with a held lock or with an
    /// earlier waiter that is still queued, so later requests never overtake
    /// an earlier overlapping one.
    fn reconcile(&mut self, resource: &ResourceId) -> Vec<LockRange> {
        let mut granted = Vec::new();
        let mut still_waiting: Vec<Waiter> = Vec::new();
        let pending: Vec<Waiter> = self.waiters.drain().collect();

        for waiter in pending {
            if waiter.sender.is_closed() {
                debug!(resource = %resource, waiter = waiter.id, "Dropping abandoned waiter");
                continue;
            }
            if still_waiting.iter().any(|earlier| earlier.conflicts_with(&waiter)) {
                still_waiting.push(waiter);
                continue;
            }
            let placement = match self.plan(&waiter.owner, resource, waiter.span, waiter.exclusive) {
                Ok(placement) => placement,
                Err(_) => {
                    still_waiting.push(waiter);
                    continue;
                }
            };
            let waited = waiter.enqueued_at.elapsed();
            if waiter.sender.send(placement.lock.clone()).is_ok() {
                let lock = self.commit(placement);
                debug!(
                    resource = %resource,
                    owner = %lock.owner,
                    waited_ms = waited.as_millis() as u64,
                    "Granted queued lock"
                );
                granted.push(lock);
            }
        }

        self.waiters.extend(still_waiting);
        granted
    }

    fn clients(&self) -> HashSet<ClientId> {
        self.locks.iter().map(|l| l.owner.client.clone()).collect()
    }

    fn count_for(&self, client: &ClientId) -> usize {
        self.locks.iter().filter(|l| l.owner.client == *client).count()
    }
}

/// Guarded table state: per-resource locks plus a client index.
#[derive(Debug, Default)]
struct TableState {
    resources: HashMap<ResourceId, ResourceLocks>,
    /// Client -> resource -> number of entries held.
    by_client: HashMap<ClientId, HashMap<ResourceId, usize>>,
}

impl TableState {
    /// Run a mutation on one resource and keep the client index current.
    fn mutate<R>(&mut self, resource: &ResourceId, f: impl FnOnce(&mut ResourceLocks) -> R) -> R {
        let entry = self.resources.entry(resource.clone()).or_default();
        let mut touched = entry.clients();
        let result = f(entry);
        touched.extend(entry.clients());

        for client in touched {
            let count = entry.count_for(&client);
            if count == 0 {
                if let Some(held) = self.by_client.get_mut(&client) {
                    held.remove(resource);
                    if held.is_empty() {
                        self.by_client.remove(&client);
                    }
                }
            } else {
                self.by_client
                    .entry(client)
                    .or_default()
                    .insert(resource.clone(), count);
            }
        }

        if entry.is_idle() {
            self.resources.remove(resource);
        }
        result
    }

    fn client_lock_count(&self, client: &ClientId) -> usize {
        self.by_client
            .get(client)
            .map(|held| held.values().sum())
            .unwrap_or(0)
    }
}

/// Lock statistics.
#[derive(Debug, Default)]
struct LockStats {
    acquired: AtomicU64,
    released: AtomicU64,
    denied: AtomicU64,
    granted: AtomicU64,
    queued: AtomicU64,
    cancelled: AtomicU64,
}

/// Public lock statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockTableStats {
    /// Total locks acquired directly.
    pub acquired: u64,
    /// Total release operations that removed something.
    pub released: u64,
    /// Total acquisitions denied.
    pub denied: u64,
    /// Total queued waiters granted.
    pub granted: u64,
    /// Total requests queued.
    pub queued: u64,
    /// Total waits cancelled.
    pub cancelled: u64,
    /// Current lock entries.
    pub active_locks: usize,
    /// Current exclusive entries.
    pub exclusive_locks: usize,
    /// Current shared entries.
    pub shared_locks: usize,
    /// Current queued waiters.
    pub waiting: usize,
    /// Resources with locks or waiters.
    pub resources: usize,
    /// Clients holding at least one lock.
    pub clients: usize,
}

/// The byte-range lock table.
pub struct LockTable {
    config: LockConfig,
    state: RwLock<TableState>,
    next_waiter: AtomicU64,
    stats: LockStats,
}

impl LockTable {
    /// Create a new lock table.
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            state: RwLock::new(TableState::default()),
            next_waiter: AtomicU64::new(1),
            stats: LockStats::default(),
        }
    }

    /// Try to acquire a lock without waiting.
    ///
    /// Re-acquiring a range the owner already holds (even partially) changes
    /// the mode of exactly the requested bytes; no byte is ever covered by
    /// two entries of the same owner.
    pub fn acquire(
        &self,
        owner: &LockOwner,
        resource: &ResourceId,
        span: ByteSpan,
        exclusive: bool,
    ) -> std::result::Result<LockRange, AcquireError> {
        let mut state = self.state.write();
        self.check_capacity(&state, owner, resource, &span)?;

        let result = state.mutate(resource, |r| {
            let placement = r.plan(owner, resource, span, exclusive)?;
            Ok(r.commit(placement))
        });
        drop(state);

        match result {
            Ok(lock) => {
                self.on_acquired(&lock);
                Ok(lock)
            }
            Err(conflict) => {
                self.on_denied(owner, resource, &conflict);
                Err(AcquireError::Conflict(conflict))
            }
        }
    }

    /// Acquire a lock, queueing the request if it conflicts.
    pub fn acquire_or_enqueue(
        &self,
        owner: &LockOwner,
        resource: &ResourceId,
        span: ByteSpan,
        exclusive: bool,
    ) -> std::result::Result<Acquisition, AcquireError> {
        let mut state = self.state.write();
        self.check_capacity(&state, owner, resource, &span)?;

        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let result = state.mutate(resource, |r| match r.plan(owner, resource, span, exclusive) {
            Ok(placement) => Acquisition::Granted(r.commit(placement)),
            Err(_) => {
                let (sender, receiver) = oneshot::channel();
                r.waiters.push(Waiter {
                    id,
                    owner: owner.clone(),
                    span,
                    exclusive,
                    enqueued_at: Instant::now(),
                    sender,
                });
                Acquisition::Queued(WaiterHandle::new(
                    id,
                    owner.clone(),
                    resource.clone(),
                    span,
                    receiver,
                ))
            }
        });
        drop(state);

        match &result {
            Acquisition::Granted(lock) => self.on_acquired(lock),
            Acquisition::Queued(_) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
                observability::record_lock_op("acquire", "queued");
                debug!(resource = %resource, owner = %owner, waiter = id, "Queued lock request");
            }
        }
        Ok(result)
    }

    /// Release a range held by an owner.
    ///
    /// Every entry of the owner overlapping the range is trimmed or split;
    /// freed waiters are granted in the same guarded section.
    pub fn release(&self, owner: &LockOwner, resource: &ResourceId, span: ByteSpan) -> Result<ReleaseOutcome> {
        let mut state = self.state.write();
        if !state.resources.contains_key(resource) {
            return Err(WardenError::NotFound(format!(
                "No locks on {} for {}",
                resource, owner
            )));
        }

        let outcome = state.mutate(resource, |r| {
            let released = r.unlock(owner, &span);
            let granted = if released > 0 {
                r.reconcile(resource)
            } else {
                Vec::new()
            };
            ReleaseOutcome { released, granted }
        });
        drop(state);

        if outcome.released == 0 {
            return Err(WardenError::NotFound(format!(
                "No lock on {} at {}+{} for {}",
                resource, span.offset, span.length, owner
            )));
        }

        self.stats.released.fetch_add(1, Ordering::Relaxed);
        observability::record_lock_op("release", "ok");
        self.on_granted(&outcome.granted);
        Ok(outcome)
    }

    /// Release every lock and queued request of one owner.
    pub fn release_all_for_owner(&self, owner: &LockOwner) -> ReleaseOutcome {
        let mut total = ReleaseOutcome::default();
        let mut dropped_waiters = 0;
        {
            let mut state = self.state.write();
            let keys: Vec<ResourceId> = state.resources.keys().cloned().collect();
            for resource in keys {
                let (outcome, waiters) = state.mutate(&resource, |r| {
                    let released = r.remove_locks(|l| l.owner == *owner);
                    let waiters = r.waiters.remove_owner(owner);
                    let granted = if released + waiters > 0 {
                        r.reconcile(&resource)
                    } else {
                        Vec::new()
                    };
                    (ReleaseOutcome { released, granted }, waiters)
                });
                total.merge(outcome);
                dropped_waiters += waiters;
            }
        }

        if total.released > 0 {
            self.stats.released.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            owner = %owner,
            released = total.released,
            waiters = dropped_waiters,
            "Released all locks for owner"
        );
        self.on_granted(&total.granted);
        total
    }

    /// Remove a queued request.
    ///
    /// Returns `false` if no matching waiter was queued.
    pub fn cancel_wait(&self, owner: &LockOwner, resource: &ResourceId, span: ByteSpan) -> bool {
        let mut state = self.state.write();
        if !state.resources.contains_key(resource) {
            return false;
        }

        let (cancelled, granted) = state.mutate(resource, |r| match r.waiters.cancel(owner, &span) {
            Some(_) => (true, r.reconcile(resource)),
            None => (false, Vec::new()),
        });
        drop(state);

        if cancelled {
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(resource = %resource, owner = %owner, "Cancelled queued lock request");
        }
        self.on_granted(&granted);
        cancelled
    }

    /// Test whether a lock could be acquired, without acquiring it.
    pub fn test(
        &self,
        owner: &LockOwner,
        resource: &ResourceId,
        span: ByteSpan,
        exclusive: bool,
    ) -> Option<LockConflict> {
        let state = self.state.read();
        state
            .resources
            .get(resource)?
            .first_conflict(owner, &span, exclusive)
            .map(LockRange::as_conflict)
    }

    /// Whether a read or write of `span` by `owner` is blocked by held locks.
    ///
    /// Reads are blocked only by another owner's exclusive lock; writes by
    /// any lock of another owner. An owner's own locks never block its I/O.
    pub fn check_io_conflict(
        &self,
        resource: &ResourceId,
        owner: &LockOwner,
        span: ByteSpan,
        is_write: bool,
    ) -> bool {
        let state = self.state.read();
        state
            .resources
            .get(resource)
            .map(|r| r.first_conflict(owner, &span, is_write).is_some())
            .unwrap_or(false)
    }

    /// List locks held on a resource, ordered by offset.
    pub fn list_locks(&self, resource: &ResourceId) -> Vec<LockRange> {
        let state = self.state.read();
        let mut locks = state
            .resources
            .get(resource)
            .map(|r| r.locks.clone())
            .unwrap_or_default();
        locks.sort_by_key(|l| l.offset);
        locks
    }

    /// List all locks held by a client.
    pub fn locks_for_client(&self, client: &ClientId) -> Vec<LockRange> {
        let state = self.state.read();
        let Some(held) = state.by_client.get(client) else {
            return Vec::new();
        };
        held.keys()
            .filter_map(|resource| state.resources.get(resource))
            .flat_map(|r| r.locks.iter().filter(|l| l.owner.client == *client).cloned())
            .collect()
    }

    /// Number of lock entries a client holds.
    pub fn client_lock_count(&self, client: &ClientId) -> usize {
        self.state.read().client_lock_count(client)
    }

    /// Number of queued waiters on a resource.
    pub fn waiting(&self, resource: &ResourceId) -> usize {
        let state = self.state.read();
        state.resources.get(resource).map(|r| r.waiters.len()).unwrap_or(0)
    }

    /// Total lock entries.
    pub fn lock_count(&self) -> usize {
        let state = self.state.read();
        state.resources.values().map(|r| r.locks.len()).sum()
    }

    /// Get lock statistics.
    pub fn stats(&self) -> LockTableStats {
        let state = self.state.read();

        let mut exclusive = 0;
        let mut shared = 0;
        let mut waiting = 0;
        for r in state.resources.values() {
            for lock in &r.locks {
                if lock.exclusive {
                    exclusive += 1;
                } else {
                    shared += 1;
                }
            }
            waiting += r.waiters.len();
        }

        LockTableStats {
            acquired: self.stats.acquired.load(Ordering::Relaxed),
            released: self.stats.released.load(Ordering::Relaxed),
            denied: self.stats.denied.load(Ordering::Relaxed),
            granted: self.stats.granted.load(Ordering::Relaxed),
            queued: self.stats.queued.load(Ordering::Relaxed),
            cancelled: self.stats.cancelled.load(Ordering::Relaxed),
            active_locks: exclusive + shared,
            exclusive_locks: exclusive,
            shared_locks: shared,
            waiting,
            resources: state.resources.len(),
            clients: state.by_client.len(),
        }
    }

    fn check_capacity(
        &self,
        state: &TableState,
        owner: &LockOwner,
        resource: &ResourceId,
        span: &ByteSpan,
    ) -> std::result::Result<(), AcquireError> {
        let merges = state
            .resources
            .get(resource)
            .map(|r| r.merges_with(owner, span))
            .unwrap_or(false);
        if !merges && state.client_lock_count(&owner.client) >= self.config.max_locks_per_client {
            self.stats.denied.fetch_add(1, Ordering::Relaxed);
            observability::record_lock_op("acquire", "too_many_locks");
            warn!(
                client = %owner.client,
                limit = self.config.max_locks_per_client,
                "Client lock limit reached"
            );
            return Err(AcquireError::TooManyLocks {
                client: owner.client.clone(),
                limit: self.config.max_locks_per_client,
            });
        }
        Ok(())
    }

    fn on_acquired(&self, lock: &LockRange) {
        self.stats.acquired.fetch_add(1, Ordering::Relaxed);
        observability::record_lock_op("acquire", "granted");
        debug!(
            resource = %lock.resource,
            owner = %lock.owner,
            offset = lock.offset,
            length = lock.length,
            exclusive = lock.exclusive,
            "Acquired lock"
        );
    }

    fn on_denied(&self, owner: &LockOwner, resource: &ResourceId, conflict: &LockConflict) {
        self.stats.denied.fetch_add(1, Ordering::Relaxed);
        observability::record_lock_op("acquire", "conflict");
        debug!(
            resource = %resource,
            owner = %owner,
            holder = %conflict.owner,
            "Lock conflict"
        );
    }

    fn on_granted(&self, granted: &[LockRange]) {
        for lock in granted {
            self.stats.granted.fetch_add(1, Ordering::Relaxed);
            observability::record_lock_op("grant", "ok");
        }
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}

impl ClientLockRelease for LockTable {
    fn resources_held_by(&self, client: &ClientId) -> Vec<ResourceId> {
        let state = self.state.read();
        state
            .by_client
            .get(client)
            .map(|held| held.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn release_client_on(&self, client: &ClientId, resource: &ResourceId) -> Result<ReleaseOutcome> {
        let mut state = self.state.write();
        let indexed = state
            .by_client
            .get(client)
            .map(|held| held.contains_key(resource))
            .unwrap_or(false);
        if !indexed {
            return Ok(ReleaseOutcome::default());
        }
        if !state.resources.contains_key(resource) {
            // Index points at a resource that no longer exists; repair it.
            if let Some(held) = state.by_client.get_mut(client) {
                held.remove(resource);
                if held.is_empty() {
                    state.by_client.remove(client);
                }
            }
            return Err(WardenError::InvalidState(format!(
                "Client {} indexed on missing resource {}",
                client, resource
            )));
        }

        let outcome = state.mutate(resource, |r| {
            let released = r.remove_locks(|l| l.owner.client == *client);
            let granted = if released > 0 {
                r.reconcile(resource)
            } else {
                Vec::new()
            };
            ReleaseOutcome { released, granted }
        });
        drop(state);

        if outcome.released > 0 {
            self.stats.released.fetch_add(1, Ordering::Relaxed);
            debug!(
                client = %client,
                resource = %resource,
                locks = outcome.released,
                "Released client locks on resource"
            );
        }
        self.on_granted(&outcome.granted);
        Ok(outcome)
    }

    fn drop_client_waiters(&self, client: &ClientId) -> usize {
        let mut state = self.state.write();
        let keys: Vec<ResourceId> = state.resources.keys().cloned().collect();
        let mut dropped = 0;
        let mut granted = Vec::new();
        for resource in keys {
            let (n, g) = state.mutate(&resource, |r| {
                let n = r.waiters.remove_client(client);
                let g = if n > 0 { r.reconcile(&resource) } else { Vec::new() };
                (n, g)
            });
            dropped += n;
            granted.extend(g);
        }
        drop(state);
        self.on_granted(&granted);
        dropped
    }
}
