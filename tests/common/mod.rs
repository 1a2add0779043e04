//! Common test utilities for integration tests.

pub mod fixtures;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use warden::config::WardenConfig;
use warden::notify::{CallbackTransport, StateChangeNotification};
use warden::registry::StoreBackend;
use warden::types::{ClientId, LockOwner, ResourceId};
use warden::{Result, WardenError};

pub use fixtures::*;

/// Test environment that owns a temporary state directory.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub state_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let state_dir = temp_dir.path().join("state");
        std::fs::create_dir_all(&state_dir).expect("Failed to create state dir");
        Self { temp_dir, state_dir }
    }

    /// Durable configuration rooted in this environment.
    pub fn config(&self, grace: Duration) -> WardenConfig {
        let mut config = WardenConfig::development();
        config.registry.backend = StoreBackend::File;
        config.storage.state_dir = self.state_dir.clone();
        config.grace.duration = grace;
        config.notifier.timeout = Duration::from_millis(500);
        config.notifier.server_name = "srv".to_string();
        config
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// How the mock transport treats one callback address.
#[derive(Debug, Clone, Copy)]
pub enum PeerBehavior {
    /// Acknowledge after the given delay.
    Ack(Duration),
    /// Refuse the connection.
    Refuse,
    /// Never answer.
    Hang,
}

/// In-process callback transport.
pub struct MockTransport {
    behaviors: Mutex<HashMap<String, PeerBehavior>>,
    delivered: Mutex<Vec<(String, StateChangeNotification)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            delivered: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, address: &str, behavior: PeerBehavior) {
        self.behaviors.lock().insert(address.to_string(), behavior);
    }

    /// Notifications acknowledged so far.
    pub fn delivered(&self) -> Vec<(String, StateChangeNotification)> {
        self.delivered.lock().clone()
    }

    /// Highest number of concurrent deliveries observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallbackTransport for MockTransport {
    async fn send_notification(
        &self,
        address: &str,
        notification: &StateChangeNotification,
        timeout: Duration,
    ) -> Result<()> {
        let behavior = self
            .behaviors
            .lock()
            .get(address)
            .copied()
            .unwrap_or(PeerBehavior::Ack(Duration::ZERO));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = match behavior {
            PeerBehavior::Ack(delay) => {
                tokio::time::sleep(delay).await;
                self.delivered
                    .lock()
                    .push((address.to_string(), notification.clone()));
                Ok(())
            }
            PeerBehavior::Refuse => Err(WardenError::ConnectionFailed(address.to_string())),
            PeerBehavior::Hang => {
                tokio::time::sleep(timeout * 10).await;
                Err(WardenError::Timeout(timeout.as_millis() as u64))
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Lock owner with a single process handle.
pub fn owner(client: &str) -> LockOwner {
    LockOwner::new(ClientId::new(client), vec![1])
}

/// Resource id from a name.
pub fn file(name: &str) -> ResourceId {
    ResourceId::from(name)
}
