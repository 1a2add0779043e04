//! Core identifier types shared across Warden.
//!
//! - [`ClientId`]: the client host whose locks and registrations are tracked
//! - [`LockOwner`]: a client plus an opaque per-process owner handle
//! - [`ResourceId`]: an opaque resource (file handle) identifier
//! - [`OpaqueToken`]: fixed-size value echoed back verbatim in notifications
//! - [`CallbackInfo`]: where and how to deliver a restart notification
//!
//! # Examples
//!
//! ```rust
//! use warden::types::{ClientId, LockOwner, ResourceId};
//!
//! let owner = LockOwner::new(ClientId::new("hostA"), b"pid-42".to_vec());
//! assert_eq!(owner.client.as_str(), "hostA");
//!
//! let file = ResourceId::from("export/data.bin");
//! assert_eq!(file.as_bytes(), b"export/data.bin");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size in bytes of the opaque token attached to a registration.
pub const OPAQUE_TOKEN_SIZE: usize = 16;

/// Identity of a client host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Create a new client ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Owner of a byte-range lock.
///
/// Two owners are equal only if both the client and the handle match, so two
/// processes on the same host are distinct owners.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwner {
    /// Client host holding the lock.
    pub client: ClientId,
    /// Owner handle (opaque to the server).
    pub handle: Vec<u8>,
}

impl LockOwner {
    /// Create a new lock owner.
    pub fn new(client: ClientId, handle: Vec<u8>) -> Self {
        Self { client, handle }
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.client)?;
        write_hex(f, &self.handle)
    }
}

/// Opaque identifier of a lockable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(Vec<u8>);

impl ResourceId {
    /// Create a resource ID from raw bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for ResourceId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// Fixed-size token supplied at registration and returned untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OpaqueToken([u8; OPAQUE_TOKEN_SIZE]);

impl OpaqueToken {
    /// Wrap raw token bytes.
    pub const fn new(bytes: [u8; OPAQUE_TOKEN_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw token bytes.
    pub fn as_bytes(&self) -> &[u8; OPAQUE_TOKEN_SIZE] {
        &self.0
    }
}

impl From<[u8; OPAQUE_TOKEN_SIZE]> for OpaqueToken {
    fn from(bytes: [u8; OPAQUE_TOKEN_SIZE]) -> Self {
        Self(bytes)
    }
}

/// RPC routing for the callback (program, version, procedure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CallbackRoute {
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
}

/// Where to send a state-change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackInfo {
    /// Network address (`host:port`).
    pub address: String,
    /// Routing information carried in the notification.
    pub route: CallbackRoute,
}

impl CallbackInfo {
    /// Create callback info with a default route.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            route: CallbackRoute::default(),
        }
    }

    /// Set the callback route.
    pub fn with_route(mut self, program: u32, version: u32, procedure: u32) -> Self {
        self.route = CallbackRoute {
            program,
            version,
            procedure,
        };
        self
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{:02x}", b)?;
    }
    Ok(())
}
