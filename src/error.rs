//! Error types for the Warden lock manager.
//!
//! This module provides a unified error type [`WardenError`] for all Warden operations,
//! along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Locking**: conflicting ranges, missing locks, per-client limits
//! - **Recovery**: grace period admission, notification delivery
//! - **Registry**: capacity and persistence of client registrations
//! - **Configuration**: invalid settings or missing configuration
//!
//! Lock-table calls that have a natural "denied" answer return typed results
//! (see [`crate::lock::AcquireError`]) rather than this enum, so callers can
//! inspect the conflicting owner without string matching.
//!
//! # Example
//!
//! ```rust
//! use warden::error::{Result, WardenError};
//!
//! fn check_length(length: u64) -> Result<()> {
//!     if length > i64::MAX as u64 {
//!         return Err(WardenError::InvalidArgument("length out of range".into()));
//!     }
//!     Ok(())
//! }
//!
//! let err = WardenError::GracePeriod { remaining_ms: 1500 };
//! assert!(err.is_retryable());
//! ```

use std::io;
use thiserror::Error;

/// Main error type for Warden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    // Locking errors
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    // Recovery errors
    #[error("Grace period in effect, retry in {remaining_ms}ms")]
    GracePeriod { remaining_ms: u64 },

    #[error("Notification to {address} failed: {reason}")]
    NotificationFailed { address: String, reason: String },

    #[error("Malformed acknowledgment: {0}")]
    MalformedAck(String),

    // Persistence errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    // Network errors
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WardenError {
    /// Check if error is retryable.
    ///
    /// Retryable errors are transient: the same request may succeed later
    /// without any change on the caller's side.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WardenError::GracePeriod { .. }
                | WardenError::Timeout(_)
                | WardenError::ConnectionFailed(_)
        )
    }

    /// Whether this error came from the persistence layer.
    pub fn is_persistence(&self) -> bool {
        matches!(self, WardenError::Persistence(_) | WardenError::Io(_))
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(e: serde_json::Error) -> Self {
        WardenError::Serialization(e.to_string())
    }
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for WardenError {
    fn from(e: rocksdb::Error) -> Self {
        WardenError::Persistence(e.to_string())
    }
}

#[cfg(feature = "rocksdb")]
impl From<bincode::Error> for WardenError {
    fn from(e: bincode::Error) -> Self {
        WardenError::Serialization(e.to_string())
    }
}

/// Result type alias for Warden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
