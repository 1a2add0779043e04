//! Byte ranges and the lock conflict rule.

use crate::types::{LockOwner, ResourceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A span of bytes within a resource.
///
/// A `length` of zero means "to the end of the resource" and is treated as
/// extending to infinity in all overlap math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteSpan {
    /// Start offset.
    pub offset: u64,
    /// Length (0 means to end of resource).
    pub length: u64,
}

impl ByteSpan {
    /// Create a new span.
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Span from `offset` to the end of the resource.
    pub fn to_end(offset: u64) -> Self {
        Self { offset, length: 0 }
    }

    /// Exclusive end offset, `None` when unbounded.
    pub fn end(&self) -> Option<u64> {
        if self.length == 0 {
            None
        } else {
            Some(self.offset.saturating_add(self.length))
        }
    }

    /// Whether the span extends to the end of the resource.
    pub fn is_unbounded(&self) -> bool {
        self.length == 0
    }

    /// Check if two spans overlap.
    pub fn overlaps(&self, other: &ByteSpan) -> bool {
        starts_before(self.offset, other.end()) && starts_before(other.offset, self.end())
    }

    /// Check if this span fully contains another.
    pub fn contains(&self, other: &ByteSpan) -> bool {
        if other.offset < self.offset {
            return false;
        }
        match (self.end(), other.end()) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(a), Some(b)) => b <= a,
        }
    }

    /// Smallest span covering both spans.
    pub fn union(&self, other: &ByteSpan) -> ByteSpan {
        let offset = self.offset.min(other.offset);
        match (self.end(), other.end()) {
            (Some(a), Some(b)) => ByteSpan::new(offset, a.max(b) - offset),
            _ => ByteSpan::to_end(offset),
        }
    }

    /// Parts of this span left after removing `cut`.
    ///
    /// Returns zero, one or two spans in ascending order.
    pub fn subtract(&self, cut: &ByteSpan) -> Vec<ByteSpan> {
        if !self.overlaps(cut) {
            return vec![*self];
        }

        let mut pieces = Vec::with_capacity(2);
        if self.offset < cut.offset {
            pieces.push(ByteSpan::new(self.offset, cut.offset - self.offset));
        }
        if let Some(cut_end) = cut.end() {
            match self.end() {
                None => pieces.push(ByteSpan::to_end(cut_end)),
                Some(end) if cut_end < end => pieces.push(ByteSpan::new(cut_end, end - cut_end)),
                Some(_) => {}
            }
        }
        pieces
    }
}

fn starts_before(offset: u64, end: Option<u64>) -> bool {
    match end {
        None => true,
        Some(end) => offset < end,
    }
}

/// A held byte-range lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRange {
    /// Owner of the lock.
    pub owner: LockOwner,
    /// Locked resource.
    pub resource: ResourceId,
    /// Start offset.
    pub offset: u64,
    /// Length (0 means to end of resource).
    pub length: u64,
    /// Exclusive (write) or shared (read) lock.
    pub exclusive: bool,
    /// When the lock was first acquired.
    pub acquired_at: DateTime<Utc>,
}

impl LockRange {
    /// Create a new lock acquired now.
    pub fn new(owner: LockOwner, resource: ResourceId, span: ByteSpan, exclusive: bool) -> Self {
        Self {
            owner,
            resource,
            offset: span.offset,
            length: span.length,
            exclusive,
            acquired_at: Utc::now(),
        }
    }

    /// The byte span covered by this lock.
    pub fn span(&self) -> ByteSpan {
        ByteSpan::new(self.offset, self.length)
    }

    /// Check if this lock conflicts with another.
    ///
    /// Locks from the same owner never conflict. Locks from different owners
    /// conflict when their ranges overlap and at least one is exclusive.
    pub fn conflicts_with(&self, other: &LockRange) -> bool {
        if self.owner == other.owner || self.resource != other.resource {
            return false;
        }
        self.blocks(&other.owner, &other.span(), other.exclusive)
    }

    /// Whether this lock would block a request from `owner` for `span`.
    pub fn blocks(&self, owner: &LockOwner, span: &ByteSpan, exclusive: bool) -> bool {
        self.owner != *owner && (self.exclusive || exclusive) && self.span().overlaps(span)
    }

    /// Describe this lock as a conflict for the caller.
    pub fn as_conflict(&self) -> LockConflict {
        LockConflict {
            owner: self.owner.clone(),
            offset: self.offset,
            length: self.length,
            exclusive: self.exclusive,
        }
    }
}

/// Lock conflict information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConflict {
    /// Owner of conflicting lock.
    pub owner: LockOwner,
    /// Start of the conflicting range.
    pub offset: u64,
    /// Length of the conflicting range.
    pub length: u64,
    /// Whether the conflicting lock is exclusive.
    pub exclusive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClientId;

    fn owner(name: &str) -> LockOwner {
        LockOwner::new(ClientId::new(name), vec![1])
    }

    fn lock(name: &str, offset: u64, length: u64, exclusive: bool) -> LockRange {
        LockRange::new(owner(name), ResourceId::from("f"), ByteSpan::new(offset, length), exclusive)
    }

    #[test]
    fn test_span_overlap() {
        let a = ByteSpan::new(0, 100);
        let b = ByteSpan::new(50, 100);
        let c = ByteSpan::new(200, 50);

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        // Adjacent spans do not overlap
        assert!(!ByteSpan::new(0, 10).overlaps(&ByteSpan::new(10, 10)));
    }

    #[test]
    fn test_unbounded_span_overlap() {
        let to_end = ByteSpan::to_end(150);
        assert!(to_end.overlaps(&ByteSpan::new(200, 50)));
        assert!(to_end.overlaps(&ByteSpan::new(100, 51)));
        assert!(!to_end.overlaps(&ByteSpan::new(100, 50)));
        assert!(to_end.overlaps(&ByteSpan::to_end(0)));
        assert!(ByteSpan::to_end(0).overlaps(&to_end));
    }

    #[test]
    fn test_saturating_end() {
        let span = ByteSpan::new(u64::MAX - 1, 10);
        assert_eq!(span.end(), Some(u64::MAX));
        assert!(span.overlaps(&ByteSpan::to_end(u64::MAX - 1)));
    }

    #[test]
    fn test_union() {
        assert_eq!(ByteSpan::new(0, 10).union(&ByteSpan::new(5, 10)), ByteSpan::new(0, 15));
        assert_eq!(ByteSpan::new(20, 10).union(&ByteSpan::to_end(25)), ByteSpan::to_end(20));
    }

    #[test]
    fn test_subtract_splits() {
        let held = ByteSpan::new(0, 100);
        assert_eq!(
            held.subtract(&ByteSpan::new(40, 20)),
            vec![ByteSpan::new(0, 40), ByteSpan::new(60, 40)]
        );
        assert_eq!(held.subtract(&ByteSpan::new(0, 100)), vec![]);
        assert_eq!(held.subtract(&ByteSpan::to_end(50)), vec![ByteSpan::new(0, 50)]);
        assert_eq!(
            ByteSpan::to_end(10).subtract(&ByteSpan::new(20, 5)),
            vec![ByteSpan::new(10, 10), ByteSpan::to_end(25)]
        );
        assert_eq!(held.subtract(&ByteSpan::new(200, 5)), vec![held]);
    }

    #[test]
    fn test_contains() {
        assert!(ByteSpan::to_end(0).contains(&ByteSpan::new(5, 5)));
        assert!(!ByteSpan::new(0, 10).contains(&ByteSpan::to_end(5)));
        assert!(ByteSpan::new(0, 10).contains(&ByteSpan::new(2, 8)));
    }

    #[test]
    fn test_conflict_rule() {
        assert!(lock("a", 0, 100, true).conflicts_with(&lock("b", 50, 100, false)));
        assert!(lock("a", 0, 100, false).conflicts_with(&lock("b", 50, 100, true)));
        assert!(!lock("a", 0, 100, false).conflicts_with(&lock("b", 50, 100, false)));
        assert!(!lock("a", 0, 100, true).conflicts_with(&lock("b", 200, 100, true)));
    }

    #[test]
    fn test_same_owner_never_conflicts() {
        assert!(!lock("a", 0, 100, true).conflicts_with(&lock("a", 0, 100, true)));
        assert!(!lock("a", 0, 0, true).conflicts_with(&lock("a", 10, 10, false)));
    }
}
