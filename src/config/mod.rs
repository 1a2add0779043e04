//! Configuration module for Warden.

use crate::error::{Result, WardenError};
use crate::grace::GraceConfig;
use crate::lock::LockConfig;
use crate::notify::NotifierConfig;
use crate::registry::{RegistryConfig, StoreBackend};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a Warden server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Node identity.
    #[serde(default)]
    pub node: NodeConfig,
    /// Lock table limits.
    #[serde(default)]
    pub locks: LockConfig,
    /// Client registry.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Restart notification.
    #[serde(default)]
    pub notifier: NotifierConfig,
    /// Post-restart grace period.
    #[serde(default)]
    pub grace: GraceConfig,
    /// On-disk state.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl WardenConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            WardenError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            WardenError::Config(format!("Failed to parse config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.name.trim().is_empty() {
            return Err(WardenError::InvalidConfig {
                field: "node.name".to_string(),
                reason: "Node name must not be empty".to_string(),
            });
        }

        if self.locks.max_locks_per_client == 0 {
            return Err(WardenError::InvalidConfig {
                field: "locks.max_locks_per_client".to_string(),
                reason: "Lock limit must be non-zero".to_string(),
            });
        }

        if self.registry.max_registrations == 0 {
            return Err(WardenError::InvalidConfig {
                field: "registry.max_registrations".to_string(),
                reason: "Registration limit must be non-zero".to_string(),
            });
        }

        if cfg!(not(feature = "rocksdb")) && self.registry.backend == StoreBackend::RocksDb {
            return Err(WardenError::InvalidConfig {
                field: "registry.backend".to_string(),
                reason: "RocksDB backend requires the `rocksdb` feature".to_string(),
            });
        }

        if self.notifier.timeout.is_zero() {
            return Err(WardenError::InvalidConfig {
                field: "notifier.timeout".to_string(),
                reason: "Notification timeout must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Create a minimal development configuration.
    pub fn development() -> Self {
        Self {
            node: NodeConfig {
                name: "dev-node".to_string(),
            },
            locks: LockConfig::default(),
            registry: RegistryConfig {
                max_registrations: 256,
                backend: StoreBackend::File,
            },
            notifier: NotifierConfig {
                timeout: Duration::from_secs(2),
                server_name: "dev-node".to_string(),
            },
            grace: GraceConfig {
                duration: Duration::from_secs(10),
            },
            storage: StorageConfig {
                state_dir: PathBuf::from("/tmp/warden/state"),
            },
            observability: ObservabilityConfig {
                metrics_enabled: false,
                log_level: "debug".to_string(),
                ..ObservabilityConfig::default()
            },
        }
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable node name, announced in restart notifications.
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "warden".to_string(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the epoch counter and registrations.
    pub state_dir: PathBuf,
}

impl StorageConfig {
    /// Epoch counter file.
    pub fn epoch_path(&self) -> PathBuf {
        self.state_dir.join("epoch")
    }

    /// Registration store location.
    pub fn registry_path(&self) -> PathBuf {
        self.state_dir.join("registrations")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/warden"),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics.
    pub metrics_enabled: bool,
    /// Metrics bind address.
    pub metrics_addr: SocketAddr,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
