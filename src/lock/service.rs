//! Protocol-agnostic lock service.
//!
//! Each wire front-end decodes its own request format into a [`LockRequest`]
//! and encodes the returned [`LockStatus`]; nothing here branches on which
//! protocol a request came from.

use super::range::{ByteSpan, LockConflict, LockRange};
use super::table::{AcquireError, Acquisition, LockTable, ReleaseOutcome};
use super::waiter::WaiterHandle;
use crate::error::Result;
use crate::grace::GracePeriod;
use crate::observability;
use crate::types::{LockOwner, ResourceId};
use std::sync::Arc;
use tracing::debug;

/// A decoded lock request.
#[derive(Debug, Clone)]
pub struct LockRequest {
    /// Who is requesting.
    pub owner: LockOwner,
    /// What to lock.
    pub resource: ResourceId,
    /// Start offset.
    pub offset: u64,
    /// Length (0 means to end of resource).
    pub length: u64,
    /// Exclusive (write) lock.
    pub exclusive: bool,
    /// Re-assertion of a lock held before a server restart.
    pub reclaim: bool,
    /// Queue the request instead of failing on conflict.
    pub block: bool,
}

impl LockRequest {
    /// Create a new non-blocking, non-reclaim request.
    pub fn new(owner: LockOwner, resource: ResourceId, offset: u64, length: u64, exclusive: bool) -> Self {
        Self {
            owner,
            resource,
            offset,
            length,
            exclusive,
            reclaim: false,
            block: false,
        }
    }

    /// Mark as a reclaim request.
    pub fn reclaim(mut self) -> Self {
        self.reclaim = true;
        self
    }

    /// Queue on conflict.
    pub fn blocking(mut self) -> Self {
        self.block = true;
        self
    }

    /// Requested span.
    pub fn span(&self) -> ByteSpan {
        ByteSpan::new(self.offset, self.length)
    }
}

/// Outcome of a lock request.
#[derive(Debug)]
pub enum LockStatus {
    /// Lock granted.
    Granted(LockRange),
    /// Refused: a conflicting lock is held.
    Denied(LockConflict),
    /// Refused: grace period in effect, retry later.
    DeniedGracePeriod,
    /// Refused: the client holds too many locks.
    DeniedNoLocks,
    /// Queued; the handle resolves when granted.
    Blocked(WaiterHandle),
}

impl LockStatus {
    /// Whether the lock was granted.
    pub fn is_granted(&self) -> bool {
        matches!(self, LockStatus::Granted(_))
    }

    /// Short status name for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            LockStatus::Granted(_) => "granted",
            LockStatus::Denied(_) => "denied",
            LockStatus::DeniedGracePeriod => "grace_period",
            LockStatus::DeniedNoLocks => "no_locks",
            LockStatus::Blocked(_) => "blocked",
        }
    }
}

/// Lock table gated by the grace period.
pub struct LockService {
    table: Arc<LockTable>,
    grace: Arc<GracePeriod>,
}

impl LockService {
    /// Create a new lock service.
    pub fn new(table: Arc<LockTable>, grace: Arc<GracePeriod>) -> Self {
        Self { table, grace }
    }

    /// Underlying lock table.
    pub fn table(&self) -> &Arc<LockTable> {
        &self.table
    }

    /// Grace period controller.
    pub fn grace(&self) -> &Arc<GracePeriod> {
        &self.grace
    }

    /// Acquire a lock.
    pub fn lock(&self, request: LockRequest) -> LockStatus {
        if self.grace.admit(request.reclaim).is_err() {
            observability::record_lock_op("acquire", "grace_period");
            debug!(
                resource = %request.resource,
                owner = %request.owner,
                "Rejected new lock during grace period"
            );
            return LockStatus::DeniedGracePeriod;
        }

        let span = request.span();
        let result = if request.block {
            self.table
                .acquire_or_enqueue(&request.owner, &request.resource, span, request.exclusive)
        } else {
            self.table
                .acquire(&request.owner, &request.resource, span, request.exclusive)
                .map(Acquisition::Granted)
        };

        match result {
            Ok(Acquisition::Granted(lock)) => LockStatus::Granted(lock),
            Ok(Acquisition::Queued(handle)) => LockStatus::Blocked(handle),
            Err(AcquireError::Conflict(conflict)) => LockStatus::Denied(conflict),
            Err(AcquireError::TooManyLocks { .. }) => LockStatus::DeniedNoLocks,
        }
    }

    /// Release a range.
    pub fn unlock(&self, owner: &LockOwner, resource: &ResourceId, offset: u64, length: u64) -> Result<ReleaseOutcome> {
        self.table.release(owner, resource, ByteSpan::new(offset, length))
    }

    /// Test for a conflicting lock.
    ///
    /// Answered during the grace period as well; only acquisition is gated.
    pub fn test(&self, request: &LockRequest) -> Option<LockConflict> {
        self.table
            .test(&request.owner, &request.resource, request.span(), request.exclusive)
    }

    /// Cancel a queued request.
    pub fn cancel(&self, request: &LockRequest) -> bool {
        self.table
            .cancel_wait(&request.owner, &request.resource, request.span())
    }

    /// Whether a read or write would be blocked.
    pub fn check_io(&self, resource: &ResourceId, owner: &LockOwner, offset: u64, length: u64, is_write: bool) -> bool {
        self.table
            .check_io_conflict(resource, owner, ByteSpan::new(offset, length), is_write)
    }

    /// Locks held on a resource.
    pub fn list(&self, resource: &ResourceId) -> Vec<LockRange> {
        self.table.list_locks(resource)
    }

    /// Release everything an owner holds.
    pub fn release_owner(&self, owner: &LockOwner) -> ReleaseOutcome {
        self.table.release_all_for_owner(owner)
    }
}
