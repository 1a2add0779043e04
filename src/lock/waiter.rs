//! Per-resource FIFO queue of blocked lock requests.

use super::range::{ByteSpan, LockRange};
use crate::error::{Result, WardenError};
use crate::types::{ClientId, LockOwner, ResourceId};
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// A blocked lock request waiting for conflicting locks to go away.
#[derive(Debug)]
pub(crate) struct Waiter {
    pub id: u64,
    pub owner: LockOwner,
    pub span: ByteSpan,
    pub exclusive: bool,
    pub enqueued_at: Instant,
    pub sender: oneshot::Sender<LockRange>,
}

impl Waiter {
    /// Whether this waiter would conflict with another queued request.
    pub fn conflicts_with(&self, other: &Waiter) -> bool {
        self.owner != other.owner
            && (self.exclusive || other.exclusive)
            && self.span.overlaps(&other.span)
    }
}

/// FIFO list of waiters for one resource.
#[derive(Debug, Default)]
pub(crate) struct WaiterQueue {
    waiters: VecDeque<Waiter>,
}

impl WaiterQueue {
    pub fn push(&mut self, waiter: Waiter) {
        self.waiters.push_back(waiter);
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Remove the oldest waiter matching owner and span exactly.
    pub fn cancel(&mut self, owner: &LockOwner, span: &ByteSpan) -> Option<Waiter> {
        let idx = self
            .waiters
            .iter()
            .position(|w| w.owner == *owner && w.span == *span)?;
        self.waiters.remove(idx)
    }

    /// Drop every waiter belonging to a client.
    pub fn remove_client(&mut self, client: &ClientId) -> usize {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.owner.client != *client);
        before - self.waiters.len()
    }

    /// Drop every waiter belonging to an owner.
    pub fn remove_owner(&mut self, owner: &LockOwner) -> usize {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.owner != *owner);
        before - self.waiters.len()
    }

    /// Drain the queue in arrival order.
    pub fn drain(&mut self) -> std::collections::vec_deque::Drain<'_, Waiter> {
        self.waiters.drain(..)
    }

    pub fn extend(&mut self, waiters: impl IntoIterator<Item = Waiter>) {
        self.waiters.extend(waiters);
    }
}

/// Handle returned for a queued lock request.
///
/// Resolves with the granted lock once conflicting locks are released.
#[derive(Debug)]
pub struct WaiterHandle {
    id: u64,
    owner: LockOwner,
    resource: ResourceId,
    span: ByteSpan,
    receiver: oneshot::Receiver<LockRange>,
}

impl WaiterHandle {
    pub(crate) fn new(
        id: u64,
        owner: LockOwner,
        resource: ResourceId,
        span: ByteSpan,
        receiver: oneshot::Receiver<LockRange>,
    ) -> Self {
        Self {
            id,
            owner,
            resource,
            span,
            receiver,
        }
    }

    /// Queue-unique waiter ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Owner that is waiting.
    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// Resource being waited on.
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// Requested span.
    pub fn span(&self) -> ByteSpan {
        self.span
    }

    /// Wait until the lock is granted.
    ///
    /// Fails if the request was cancelled or its owner was cleaned up.
    pub async fn granted(self) -> Result<LockRange> {
        let WaiterHandle {
            owner,
            resource,
            receiver,
            ..
        } = self;
        receiver.await.map_err(|_| {
            WardenError::InvalidState(format!("Wait on {} for {} was cancelled", resource, owner))
        })
    }

    /// Check for a grant without waiting.
    pub fn try_granted(&mut self) -> Option<LockRange> {
        self.receiver.try_recv().ok()
    }
}
