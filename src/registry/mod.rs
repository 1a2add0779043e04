//! Client registry.
//!
//! Durable record of clients that asked to be told when this server
//! restarts. Registrations are keyed by `(client_id, monitor_target)`;
//! registering the same pair again updates it in place.
//!
//! The in-memory map is authoritative for the running process. Every change
//! is also written to the configured [`RegistrationStore`] while the map is
//! still locked, so concurrent changes reach the store in the order they hit
//! memory. If a store write fails the change stays in memory and a warning
//! is logged.

mod store;

pub use store::{FileRegistrationStore, MemoryRegistrationStore, RegistrationStore};
#[cfg(feature = "rocksdb")]
pub use store::RocksRegistrationStore;

use crate::error::{Result, WardenError};
use crate::observability;
use crate::types::{CallbackInfo, ClientId, OpaqueToken};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Maximum number of registrations; new ones beyond it are rejected.
    pub max_registrations: usize,
    /// Persistence backend.
    pub backend: StoreBackend,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_registrations: 1024,
            backend: StoreBackend::File,
        }
    }
}

/// Registration persistence backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-memory only; registrations are lost on restart.
    Memory,
    /// JSON files under the state directory.
    File,
    /// RocksDB under the state directory (requires the `rocksdb` feature).
    RocksDb,
}

/// Identity of a registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistrationKey {
    pub client_id: ClientId,
    pub monitor_target: String,
}

impl RegistrationKey {
    /// Create a new key.
    pub fn new(client_id: ClientId, monitor_target: impl Into<String>) -> Self {
        Self {
            client_id,
            monitor_target: monitor_target.into(),
        }
    }

    /// Byte form: client and target separated by a NUL byte.
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.client_id.as_str().len() + self.monitor_target.len() + 1);
        bytes.extend_from_slice(self.client_id.as_str().as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(self.monitor_target.as_bytes());
        bytes
    }

    /// Fixed-length hex SHA-256 of the byte form, safe as a file name.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.as_bytes()))
    }
}

/// A client's request to be notified of server restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistration {
    /// Client that registered.
    pub client_id: ClientId,
    /// Name being monitored.
    pub monitor_target: String,
    /// Where to deliver the notification.
    pub callback: CallbackInfo,
    /// Token echoed back verbatim.
    pub token: OpaqueToken,
    /// First registration time.
    pub registered_at: DateTime<Utc>,
    /// Last registration or successful notification.
    pub last_seen: DateTime<Utc>,
    /// Server epoch when first registered.
    pub epoch_at_registration: u64,
}

impl ClientRegistration {
    /// Create a new registration.
    pub fn new(
        client_id: ClientId,
        monitor_target: impl Into<String>,
        callback: CallbackInfo,
        token: OpaqueToken,
        epoch: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            client_id,
            monitor_target: monitor_target.into(),
            callback,
            token,
            registered_at: now,
            last_seen: now,
            epoch_at_registration: epoch,
        }
    }

    /// Registration key.
    pub fn key(&self) -> RegistrationKey {
        RegistrationKey::new(self.client_id.clone(), self.monitor_target.clone())
    }
}

/// Reply to a status probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    /// Current server epoch.
    pub epoch: u64,
    /// Whether any client monitors the probed name.
    pub monitored: bool,
}

/// The client registry.
pub struct ClientRegistry {
    config: RegistryConfig,
    store: Arc<dyn RegistrationStore>,
    entries: RwLock<HashMap<RegistrationKey, ClientRegistration>>,
    epoch: u64,
}

impl ClientRegistry {
    /// Load all persisted registrations.
    ///
    /// Failing to read the store is fatal: starting empty would silently
    /// skip every restart notification.
    pub fn load(config: RegistryConfig, store: Arc<dyn RegistrationStore>, epoch: u64) -> Result<Self> {
        let mut entries = HashMap::new();
        for reg in store.list()? {
            entries.insert(reg.key(), reg);
        }

        if entries.len() > config.max_registrations {
            warn!(
                loaded = entries.len(),
                limit = config.max_registrations,
                "Loaded more registrations than the configured limit"
            );
        }
        info!(
            backend = store.name(),
            durable = store.is_durable(),
            count = entries.len(),
            "Loaded client registrations"
        );
        observability::set_registrations(entries.len());

        Ok(Self {
            config,
            store,
            entries: RwLock::new(entries),
            epoch,
        })
    }

    /// Create an empty in-memory registry.
    pub fn in_memory(config: RegistryConfig, epoch: u64) -> Self {
        Self {
            config,
            store: Arc::new(MemoryRegistrationStore::new()),
            entries: RwLock::new(HashMap::new()),
            epoch,
        }
    }

    /// Register (or refresh) a client's monitor request.
    ///
    /// A repeat call for the same `(client_id, monitor_target)` updates the
    /// callback and token in place. A new key beyond the configured limit
    /// is rejected; existing registrations are never evicted.
    pub fn register(
        &self,
        client_id: ClientId,
        monitor_target: impl Into<String>,
        callback: CallbackInfo,
        token: OpaqueToken,
    ) -> Result<ClientRegistration> {
        let key = RegistrationKey::new(client_id, monitor_target);

        // Store writes happen under the map guard so the store sees changes
        // in the same order as memory.
        let mut entries = self.entries.write();
        let registration = match entries.get_mut(&key) {
            Some(existing) => {
                existing.callback = callback;
                existing.token = token;
                existing.last_seen = Utc::now();
                existing.clone()
            }
            None => {
                if entries.len() >= self.config.max_registrations {
                    observability::record_registration("rejected");
                    return Err(WardenError::CapacityExceeded(format!(
                        "Registry full ({} entries), rejecting {} monitoring {}",
                        self.config.max_registrations, key.client_id, key.monitor_target
                    )));
                }
                let reg = ClientRegistration::new(
                    key.client_id.clone(),
                    key.monitor_target.clone(),
                    callback,
                    token,
                    self.epoch,
                );
                entries.insert(key, reg.clone());
                reg
            }
        };
        self.persist(&registration);
        let count = entries.len();
        drop(entries);

        observability::record_registration("registered");
        observability::set_registrations(count);
        debug!(
            client = %registration.client_id,
            target = %registration.monitor_target,
            "Registered client monitor"
        );
        Ok(registration)
    }

    /// Remove one registration.
    pub fn unregister(&self, client_id: &ClientId, monitor_target: &str) -> Option<ClientRegistration> {
        let key = RegistrationKey::new(client_id.clone(), monitor_target);
        let mut entries = self.entries.write();
        let removed = entries.remove(&key)?;
        if let Err(e) = self.store.delete(&key) {
            warn!(client = %client_id, error = %e, "Failed to delete persisted registration");
        }
        let count = entries.len();
        drop(entries);

        self.after_removal(1, count);
        Some(removed)
    }

    /// Remove every registration of a client.
    pub fn unregister_all(&self, client_id: &ClientId) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| key.client_id != *client_id);
        let removed = before - entries.len();
        if removed > 0 {
            if let Err(e) = self.store.delete_client(client_id) {
                warn!(client = %client_id, error = %e, "Failed to delete persisted registrations");
            }
        }
        let count = entries.len();
        drop(entries);

        if removed > 0 {
            self.after_removal(removed, count);
        }
        removed
    }

    /// Remove every registration that monitors `name`.
    pub fn unregister_monitor_target(&self, name: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| key.monitor_target != name);
        let removed = before - entries.len();
        if removed > 0 {
            if let Err(e) = self.store.delete_by_monitor_target(name) {
                warn!(target = name, error = %e, "Failed to delete persisted registrations");
            }
        }
        let count = entries.len();
        drop(entries);

        if removed > 0 {
            self.after_removal(removed, count);
        }
        removed
    }

    /// Record a successful contact with a registered client.
    pub fn touch(&self, key: &RegistrationKey) {
        let mut entries = self.entries.write();
        if let Some(reg) = entries.get_mut(key) {
            reg.last_seen = Utc::now();
            let reg = reg.clone();
            self.persist(&reg);
        }
    }

    /// Look up one registration.
    pub fn get(&self, client_id: &ClientId, monitor_target: &str) -> Option<ClientRegistration> {
        let key = RegistrationKey::new(client_id.clone(), monitor_target);
        self.entries.read().get(&key).cloned()
    }

    /// All registrations.
    pub fn list(&self) -> Vec<ClientRegistration> {
        self.entries.read().values().cloned().collect()
    }

    /// Registrations of one client.
    pub fn list_client(&self, client_id: &ClientId) -> Vec<ClientRegistration> {
        self.entries
            .read()
            .values()
            .filter(|reg| reg.client_id == *client_id)
            .cloned()
            .collect()
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Server epoch this registry was loaded under.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Answer a status probe for `monitor_target`.
    pub fn status(&self, monitor_target: &str) -> StatusReply {
        let monitored = self
            .entries
            .read()
            .keys()
            .any(|key| key.monitor_target == monitor_target);
        StatusReply {
            epoch: self.epoch,
            monitored,
        }
    }

    /// Whether registrations are written to a durable backend.
    pub fn is_durable(&self) -> bool {
        self.store.is_durable()
    }

    fn persist(&self, registration: &ClientRegistration) {
        if let Err(e) = self.store.put(registration) {
            observability::record_registration("persist_failed");
            warn!(
                client = %registration.client_id,
                target = %registration.monitor_target,
                backend = self.store.name(),
                error = %e,
                "Failed to persist registration; keeping in-memory state"
            );
        }
    }

    fn after_removal(&self, removed: usize, remaining: usize) {
        observability::set_registrations(remaining);
        debug!(removed, "Removed client registrations");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max: usize) -> RegistryConfig {
        RegistryConfig {
            max_registrations: max,
            backend: StoreBackend::Memory,
        }
    }

    fn token(b: u8) -> OpaqueToken {
        OpaqueToken::new([b; 16])
    }

    /// Store whose writes always fail.
    struct BrokenStore;

    impl RegistrationStore for BrokenStore {
        fn put(&self, _: &ClientRegistration) -> Result<()> {
            Err(WardenError::Persistence("disk full".into()))
        }
        fn get(&self, _: &RegistrationKey) -> Result<Option<ClientRegistration>> {
            Ok(None)
        }
        fn delete(&self, _: &RegistrationKey) -> Result<bool> {
            Err(WardenError::Persistence("disk full".into()))
        }
        fn list(&self) -> Result<Vec<ClientRegistration>> {
            Ok(Vec::new())
        }
        fn delete_all(&self) -> Result<usize> {
            Ok(0)
        }
        fn delete_by_monitor_target(&self, _: &str) -> Result<usize> {
            Ok(0)
        }
        fn delete_client(&self, _: &ClientId) -> Result<usize> {
            Ok(0)
        }
        fn is_durable(&self) -> bool {
            true
        }
        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[test]
    fn test_register_is_idempotent_upsert() {
        let registry = ClientRegistry::in_memory(config(10), 5);
        let client = ClientId::new("c1");

        registry
            .register(client.clone(), "hostA", CallbackInfo::new("10.0.0.1:1"), token(1))
            .unwrap();
        let updated = registry
            .register(client.clone(), "hostA", CallbackInfo::new("10.0.0.2:2"), token(2))
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(updated.callback.address, "10.0.0.2:2");
        assert_eq!(updated.token, token(2));
        assert_eq!(updated.epoch_at_registration, 5);
        assert!(updated.last_seen >= updated.registered_at);
    }

    #[test]
    fn test_capacity_rejects_new_keys_only() {
        let registry = ClientRegistry::in_memory(config(1), 1);
        registry
            .register(ClientId::new("c1"), "hostA", CallbackInfo::new("a:1"), token(1))
            .unwrap();

        let err = registry
            .register(ClientId::new("c2"), "hostB", CallbackInfo::new("b:1"), token(1))
            .unwrap_err();
        assert!(matches!(err, WardenError::CapacityExceeded(_)));

        // Updating the existing entry is still allowed
        registry
            .register(ClientId::new("c1"), "hostA", CallbackInfo::new("a:2"), token(9))
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&ClientId::new("c1"), "hostA").is_some());
    }

    #[test]
    fn test_unregister_variants() {
        let registry = ClientRegistry::in_memory(config(10), 1);
        let c1 = ClientId::new("c1");
        for target in ["hostA", "hostB", "hostC"] {
            registry
                .register(c1.clone(), target, CallbackInfo::new("a:1"), token(1))
                .unwrap();
        }
        registry
            .register(ClientId::new("c2"), "hostA", CallbackInfo::new("a:1"), token(1))
            .unwrap();

        assert!(registry.unregister(&c1, "hostC").is_some());
        assert!(registry.unregister(&c1, "hostC").is_none());
        assert_eq!(registry.unregister_monitor_target("hostA"), 2);
        assert_eq!(registry.unregister_all(&c1), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_persistence_failure_keeps_memory_state() {
        let registry = ClientRegistry::load(config(10), Arc::new(BrokenStore), 1).unwrap();
        let c1 = ClientId::new("c1");

        registry
            .register(c1.clone(), "hostA", CallbackInfo::new("a:1"), token(1))
            .unwrap();
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(&c1, "hostA").is_some());
        assert!(registry.is_empty());
    }

    /// Memory store whose `put` parks until released.
    struct GatedStore {
        inner: MemoryRegistrationStore,
        entered: parking_lot::Mutex<std::sync::mpsc::Sender<()>>,
        release: parking_lot::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl RegistrationStore for GatedStore {
        fn put(&self, reg: &ClientRegistration) -> Result<()> {
            let _ = self.entered.lock().send(());
            let _ = self.release.lock().recv();
            self.inner.put(reg)
        }
        fn get(&self, key: &RegistrationKey) -> Result<Option<ClientRegistration>> {
            self.inner.get(key)
        }
        fn delete(&self, key: &RegistrationKey) -> Result<bool> {
            self.inner.delete(key)
        }
        fn list(&self) -> Result<Vec<ClientRegistration>> {
            self.inner.list()
        }
        fn delete_all(&self) -> Result<usize> {
            self.inner.delete_all()
        }
        fn delete_by_monitor_target(&self, name: &str) -> Result<usize> {
            self.inner.delete_by_monitor_target(name)
        }
        fn delete_client(&self, client_id: &ClientId) -> Result<usize> {
            self.inner.delete_client(client_id)
        }
        fn is_durable(&self) -> bool {
            true
        }
        fn name(&self) -> &'static str {
            "gated"
        }
    }

    #[test]
    fn test_removal_during_slow_put_keeps_store_in_sync() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let store = Arc::new(GatedStore {
            inner: MemoryRegistrationStore::new(),
            entered: parking_lot::Mutex::new(entered_tx),
            release: parking_lot::Mutex::new(release_rx),
        });
        let registry = Arc::new(ClientRegistry::load(config(10), store.clone(), 1).unwrap());
        let c1 = ClientId::new("c1");

        let registering = {
            let registry = registry.clone();
            let c1 = c1.clone();
            std::thread::spawn(move || {
                registry
                    .register(c1, "hostA", CallbackInfo::new("a:1"), token(1))
                    .unwrap();
            })
        };
        entered_rx.recv().unwrap();

        let removing = {
            let registry = registry.clone();
            let c1 = c1.clone();
            std::thread::spawn(move || registry.unregister_all(&c1))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        release_tx.send(()).unwrap();

        registering.join().unwrap();
        let removed = removing.join().unwrap();

        assert_eq!(removed, 1);
        assert!(registry.is_empty());
        assert!(store.list().unwrap().is_empty());
        let reloaded = ClientRegistry::load(config(10), store, 2).unwrap();
        assert!(reloaded.is_empty());
    }

    #[test]
    fn test_load_from_store() {
        let store = Arc::new(MemoryRegistrationStore::new());
        store
            .put(&ClientRegistration::new(
                ClientId::new("c1"),
                "hostA",
                CallbackInfo::new("a:1"),
                token(4),
                2,
            ))
            .unwrap();

        let registry = ClientRegistry::load(config(10), store, 3).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.epoch(), 3);
        let reg = registry.get(&ClientId::new("c1"), "hostA").unwrap();
        assert_eq!(reg.epoch_at_registration, 2);
    }

    #[test]
    fn test_status_probe() {
        let registry = ClientRegistry::in_memory(config(10), 7);
        registry
            .register(ClientId::new("c1"), "hostA", CallbackInfo::new("a:1"), token(1))
            .unwrap();

        assert_eq!(registry.status("hostA"), StatusReply { epoch: 7, monitored: true });
        assert!(!registry.status("hostZ").monitored);
    }

    #[test]
    fn test_key_encoding_is_unambiguous() {
        let a = RegistrationKey::new(ClientId::new("ab"), "c");
        let b = RegistrationKey::new(ClientId::new("a"), "bc");
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);

        let long = RegistrationKey::new(ClientId::new("c".repeat(300)), "h".repeat(300));
        assert_eq!(long.digest().len(), 64);
    }
}
