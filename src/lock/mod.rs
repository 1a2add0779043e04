//! Byte-range locking.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  LockService: grace gating, decoded requests  │
//! ├──────────────────────────────────────────────┤
//! │  LockTable: conflicts, release + reconcile    │
//! ├──────────────────────────────────────────────┤
//! │  WaiterQueue (per resource, FIFO)             │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use warden::lock::{ByteSpan, LockTable};
//! use warden::types::{ClientId, LockOwner, ResourceId};
//!
//! let table = LockTable::default();
//! let file = ResourceId::from("F");
//! let a = LockOwner::new(ClientId::new("A"), vec![1]);
//! let b = LockOwner::new(ClientId::new("B"), vec![1]);
//!
//! table.acquire(&a, &file, ByteSpan::new(0, 100), true).unwrap();
//! assert!(table.acquire(&b, &file, ByteSpan::new(50, 100), true).is_err());
//! assert!(table.acquire(&b, &file, ByteSpan::new(200, 100), false).is_ok());
//! ```

mod range;
mod service;
mod table;
mod waiter;

pub use range::{ByteSpan, LockConflict, LockRange};
pub use service::{LockRequest, LockService, LockStatus};
pub use table::{
    AcquireError, Acquisition, LockConfig, LockTable, LockTableStats, ReleaseOutcome,
};
pub use waiter::WaiterHandle;
