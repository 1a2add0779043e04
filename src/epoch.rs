//! Server epoch.
//!
//! A counter incremented exactly once per startup and persisted, so clients
//! can tell that the server they talk to is a new incarnation.

use crate::error::{Result, WardenError};
use parking_lot::Mutex;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Persistence for the epoch counter.
pub trait EpochStore: Send + Sync {
    /// Last saved epoch, if any.
    fn load(&self) -> Result<Option<u64>>;

    /// Save a new epoch.
    fn save(&self, epoch: u64) -> Result<()>;
}

/// In-memory epoch store.
#[derive(Debug, Default)]
pub struct MemoryEpochStore {
    value: Mutex<Option<u64>>,
}

impl MemoryEpochStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `epoch`.
    pub fn with_epoch(epoch: u64) -> Self {
        Self {
            value: Mutex::new(Some(epoch)),
        }
    }
}

impl EpochStore for MemoryEpochStore {
    fn load(&self) -> Result<Option<u64>> {
        Ok(*self.value.lock())
    }

    fn save(&self, epoch: u64) -> Result<()> {
        *self.value.lock() = Some(epoch);
        Ok(())
    }
}

/// Epoch stored as a decimal number in a single file.
pub struct FileEpochStore {
    path: PathBuf,
}

impl FileEpochStore {
    /// Use `path` for the counter. The parent directory is created if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Counter file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EpochStore for FileEpochStore {
    fn load(&self) -> Result<Option<u64>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        content.trim().parse::<u64>().map(Some).map_err(|e| {
            WardenError::Persistence(format!(
                "Corrupt epoch file {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn save(&self, epoch: u64) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            writeln!(file, "{}", epoch)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

/// The current server incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerEpoch(u64);

impl ServerEpoch {
    /// Load the previous epoch, increment it and persist the result.
    ///
    /// Fails if the new value cannot be saved; the caller must not start
    /// serving in that case.
    pub fn advance(store: &dyn EpochStore) -> Result<Self> {
        let previous = store.load()?.unwrap_or(0);
        let next = previous.checked_add(1).ok_or_else(|| {
            WardenError::InvalidState("Server epoch counter exhausted".into())
        })?;
        store.save(next)?;
        info!(previous, epoch = next, "Advanced server epoch");
        Ok(Self(next))
    }

    /// Wrap a raw value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServerEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
