//! Persistence backends for client registrations.
//!
//! The registry keeps its working set in memory and writes every change
//! through a [`RegistrationStore`] so that registrations outlive a restart
//! when a durable backend is configured.

use super::{ClientRegistration, RegistrationKey};
use crate::error::{Result, WardenError};
use crate::types::ClientId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Persistence interface for registrations.
pub trait RegistrationStore: Send + Sync {
    /// Insert or replace a registration.
    fn put(&self, registration: &ClientRegistration) -> Result<()>;

    /// Fetch one registration.
    fn get(&self, key: &RegistrationKey) -> Result<Option<ClientRegistration>>;

    /// Delete one registration. Returns whether it existed.
    fn delete(&self, key: &RegistrationKey) -> Result<bool>;

    /// All stored registrations.
    fn list(&self) -> Result<Vec<ClientRegistration>>;

    /// Delete everything. Returns the number removed.
    fn delete_all(&self) -> Result<usize>;

    /// Delete every registration monitoring `name`.
    fn delete_by_monitor_target(&self, name: &str) -> Result<usize>;

    /// Delete every registration of a client.
    fn delete_client(&self, client: &ClientId) -> Result<usize>;

    /// Whether registrations survive a process restart.
    fn is_durable(&self) -> bool;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Non-durable backend; everything is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryRegistrationStore {
    entries: RwLock<HashMap<RegistrationKey, ClientRegistration>>,
}

impl MemoryRegistrationStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegistrationStore for MemoryRegistrationStore {
    fn put(&self, registration: &ClientRegistration) -> Result<()> {
        self.entries
            .write()
            .insert(registration.key(), registration.clone());
        Ok(())
    }

    fn get(&self, key: &RegistrationKey) -> Result<Option<ClientRegistration>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn delete(&self, key: &RegistrationKey) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn list(&self) -> Result<Vec<ClientRegistration>> {
        Ok(self.entries.read().values().cloned().collect())
    }

    fn delete_all(&self) -> Result<usize> {
        let mut entries = self.entries.write();
        let count = entries.len();
        entries.clear();
        Ok(count)
    }

    fn delete_by_monitor_target(&self, name: &str) -> Result<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| key.monitor_target != name);
        Ok(before - entries.len())
    }

    fn delete_client(&self, client: &ClientId) -> Result<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| key.client_id != *client);
        Ok(before - entries.len())
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Durable backend storing one JSON file per registration.
///
/// Files are named by the key digest; the full key lives inside the JSON.
///
/// Writes go to a temporary file that is synced and renamed into place, so a
/// crash never leaves a half-written registration behind.
pub struct FileRegistrationStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRegistrationStore {
    /// Open or create a store rooted at `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "Opened registration store");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the registration files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &RegistrationKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.digest()))
    }

    fn entry_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    fn read_entry(path: &Path) -> Result<ClientRegistration> {
        let data = fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| {
            WardenError::Persistence(format!("Corrupt registration {}: {}", path.display(), e))
        })
    }

    fn remove_path(path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_matching(&self, matches: impl Fn(&ClientRegistration) -> bool) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let mut removed = 0;
        for path in self.entry_paths()? {
            match Self::read_entry(&path) {
                Ok(reg) if matches(&reg) => {
                    if Self::remove_path(&path)? {
                        removed += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable registration"),
            }
        }
        Ok(removed)
    }
}

impl RegistrationStore for FileRegistrationStore {
    fn put(&self, registration: &ClientRegistration) -> Result<()> {
        let path = self.path_for(&registration.key());
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(registration)?;

        let _guard = self.write_lock.lock();
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn get(&self, key: &RegistrationKey) -> Result<Option<ClientRegistration>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_entry(&path).map(Some)
    }

    fn delete(&self, key: &RegistrationKey) -> Result<bool> {
        let _guard = self.write_lock.lock();
        Self::remove_path(&self.path_for(key))
    }

    fn list(&self) -> Result<Vec<ClientRegistration>> {
        let mut registrations = Vec::new();
        for path in self.entry_paths()? {
            match Self::read_entry(&path) {
                Ok(reg) => registrations.push(reg),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable registration"),
            }
        }
        Ok(registrations)
    }

    fn delete_all(&self) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let mut removed = 0;
        for path in self.entry_paths()? {
            if Self::remove_path(&path)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn delete_by_monitor_target(&self, name: &str) -> Result<usize> {
        self.delete_matching(|reg| reg.monitor_target == name)
    }

    fn delete_client(&self, client: &ClientId) -> Result<usize> {
        self.delete_matching(|reg| reg.client_id == *client)
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Durable backend on RocksDB with bincode values.
#[cfg(feature = "rocksdb")]
pub struct RocksRegistrationStore {
    db: rocksdb::DB,
}

#[cfg(feature = "rocksdb")]
impl RocksRegistrationStore {
    /// Open or create a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        let db = rocksdb::DB::open(&opts, path)?;
        Ok(Self { db })
    }

    fn scan(&self) -> Result<Vec<(Box<[u8]>, ClientRegistration)>> {
        let mut entries = Vec::new();
        for item in self.db.iterator(rocksdb::IteratorMode::Start) {
            let (key, value) = item?;
            let reg: ClientRegistration = bincode::deserialize(&value)?;
            entries.push((key, reg));
        }
        Ok(entries)
    }

    fn delete_matching(&self, matches: impl Fn(&ClientRegistration) -> bool) -> Result<usize> {
        let mut batch = rocksdb::WriteBatch::default();
        let mut removed = 0;
        for (key, reg) in self.scan()? {
            if matches(&reg) {
                batch.delete(&key);
                removed += 1;
            }
        }
        self.db.write(batch)?;
        Ok(removed)
    }
}

#[cfg(feature = "rocksdb")]
impl RegistrationStore for RocksRegistrationStore {
    fn put(&self, registration: &ClientRegistration) -> Result<()> {
        let value = bincode::serialize(registration)?;
        self.db.put(registration.key().as_bytes(), value)?;
        self.db.flush()?;
        Ok(())
    }

    fn get(&self, key: &RegistrationKey) -> Result<Option<ClientRegistration>> {
        match self.db.get(key.as_bytes())? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, key: &RegistrationKey) -> Result<bool> {
        let existed = self.db.get(key.as_bytes())?.is_some();
        if existed {
            self.db.delete(key.as_bytes())?;
        }
        Ok(existed)
    }

    fn list(&self) -> Result<Vec<ClientRegistration>> {
        Ok(self.scan()?.into_iter().map(|(_, reg)| reg).collect())
    }

    fn delete_all(&self) -> Result<usize> {
        self.delete_matching(|_| true)
    }

    fn delete_by_monitor_target(&self, name: &str) -> Result<usize> {
        self.delete_matching(|reg| reg.monitor_target == name)
    }

    fn delete_client(&self, client: &ClientId) -> Result<usize> {
        self.delete_matching(|reg| reg.client_id == *client)
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "rocksdb"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallbackInfo, OpaqueToken};
    use tempfile::TempDir;

    fn registration(client: &str, target: &str) -> ClientRegistration {
        ClientRegistration::new(
            ClientId::new(client),
            target,
            CallbackInfo::new("127.0.0.1:4045"),
            OpaqueToken::new([3; 16]),
            1,
        )
    }

    fn exercise(store: &dyn RegistrationStore) {
        store.put(&registration("c1", "hostA")).unwrap();
        store.put(&registration("c1", "hostB")).unwrap();
        store.put(&registration("c2", "hostA")).unwrap();
        assert_eq!(store.list().unwrap().len(), 3);

        let key = RegistrationKey::new(ClientId::new("c1"), "hostB");
        assert!(store.get(&key).unwrap().is_some());
        assert!(store.delete(&key).unwrap());
        assert!(!store.delete(&key).unwrap());
        assert!(store.get(&key).unwrap().is_none());

        assert_eq!(store.delete_by_monitor_target("hostA").unwrap(), 2);
        assert!(store.list().unwrap().is_empty());

        store.put(&registration("c3", "hostC")).unwrap();
        store.put(&registration("c3", "hostD")).unwrap();
        assert_eq!(store.delete_client(&ClientId::new("c3")).unwrap(), 2);

        store.put(&registration("c4", "hostE")).unwrap();
        assert_eq!(store.delete_all().unwrap(), 1);
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryRegistrationStore::new();
        assert!(!store.is_durable());
        exercise(&store);
    }

    #[test]
    fn test_file_store() {
        let dir = TempDir::new().unwrap();
        let store = FileRegistrationStore::open(dir.path()).unwrap();
        assert!(store.is_durable());
        exercise(&store);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileRegistrationStore::open(dir.path()).unwrap();
            store.put(&registration("c1", "hostA")).unwrap();
        }

        let store = FileRegistrationStore::open(dir.path()).unwrap();
        let all = store.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].monitor_target, "hostA");
        assert_eq!(all[0].token, OpaqueToken::new([3; 16]));
    }

    #[test]
    fn test_file_store_long_names() {
        let dir = TempDir::new().unwrap();
        let store = FileRegistrationStore::open(dir.path()).unwrap();
        let client = format!("{}.example.com", "node".repeat(60));
        let target = format!("{}.example.com", "server".repeat(40));

        store.put(&registration(&client, &target)).unwrap();

        let key = RegistrationKey::new(ClientId::new(client.clone()), target.clone());
        let reg = store.get(&key).unwrap().unwrap();
        assert_eq!(reg.monitor_target, target);
        assert_eq!(store.delete_client(&ClientId::new(client)).unwrap(), 1);
    }

    #[test]
    fn test_file_store_skips_corrupt_entries() {
        let dir = TempDir::new().unwrap();
        let store = FileRegistrationStore::open(dir.path()).unwrap();
        store.put(&registration("c1", "hostA")).unwrap();
        fs::write(dir.path().join("garbage.json"), b"{not json").unwrap();

        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[cfg(feature = "rocksdb")]
    #[test]
    fn test_rocksdb_store() {
        let dir = TempDir::new().unwrap();
        let store = RocksRegistrationStore::open(dir.path()).unwrap();
        exercise(&store);
    }
}
