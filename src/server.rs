//! Server assembly.
//!
//! Startup order matters for recovery:
//!
//! 1. advance and persist the server epoch
//! 2. load client registrations
//! 3. open the grace window
//! 4. wire the lock service, cleanup, notifier and admin handler
//! 5. notify every registered client of the new epoch in the background

use crate::admin::AdminHandler;
use crate::cleanup::CrashCleanup;
use crate::config::WardenConfig;
use crate::epoch::{EpochStore, FileEpochStore, MemoryEpochStore, ServerEpoch};
use crate::error::{Result, WardenError};
use crate::grace::GracePeriod;
use crate::lock::{LockService, LockTable};
use crate::notify::{CallbackTransport, CrashNotifier, NotifyReport, TcpCallbackTransport};
use crate::observability;
use crate::registry::{
    ClientRegistry, FileRegistrationStore, MemoryRegistrationStore, RegistrationStore, StoreBackend,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{error, info};

/// Builder for [`Warden`], with injectable persistence and transport.
pub struct WardenBuilder {
    config: WardenConfig,
    epoch_store: Option<Arc<dyn EpochStore>>,
    registration_store: Option<Arc<dyn RegistrationStore>>,
    transport: Option<Arc<dyn CallbackTransport>>,
}

impl WardenBuilder {
    /// Use a specific epoch store instead of the configured one.
    pub fn epoch_store(mut self, store: Arc<dyn EpochStore>) -> Self {
        self.epoch_store = Some(store);
        self
    }

    /// Use a specific registration store instead of the configured one.
    pub fn registration_store(mut self, store: Arc<dyn RegistrationStore>) -> Self {
        self.registration_store = Some(store);
        self
    }

    /// Use a specific callback transport instead of TCP.
    pub fn transport(mut self, transport: Arc<dyn CallbackTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Run startup and launch the restart notification round.
    pub async fn start(self) -> Result<Warden> {
        let config = self.config;
        config.validate()?;

        let epoch_store = match self.epoch_store {
            Some(store) => store,
            None => open_epoch_store(&config)?,
        };
        let epoch = ServerEpoch::advance(epoch_store.as_ref()).map_err(|e| {
            error!(error = %e, "Failed to persist server epoch");
            e
        })?;

        let registration_store = match self.registration_store {
            Some(store) => store,
            None => open_registration_store(&config)?,
        };
        let registry = Arc::new(ClientRegistry::load(
            config.registry.clone(),
            registration_store,
            epoch.get(),
        )?);

        let grace = Arc::new(GracePeriod::start(config.grace.duration));
        let table = Arc::new(LockTable::new(config.locks.clone()));
        let service = Arc::new(LockService::new(table.clone(), grace.clone()));
        let cleanup = Arc::new(CrashCleanup::new(table.clone(), registry.clone()));

        let transport: Arc<dyn CallbackTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(TcpCallbackTransport::new()),
        };
        let mut notifier_config = config.notifier.clone();
        if notifier_config.server_name.is_empty() {
            notifier_config.server_name = config.node.name.clone();
        }
        let notifier = Arc::new(CrashNotifier::new(
            notifier_config,
            registry.clone(),
            cleanup.clone(),
            transport,
        ));
        let admin = Arc::new(AdminHandler::new(
            cleanup.clone(),
            registry.clone(),
            table.clone(),
            grace.clone(),
        ));

        let grace_watch = spawn_grace_watch(grace.clone());
        let recovery = {
            let notifier = notifier.clone();
            let epoch = epoch.get();
            tokio::spawn(async move { notifier.notify_all(epoch).await })
        };
        let recovery_abort = recovery.abort_handle();

        info!(
            node = %config.node.name,
            epoch = %epoch,
            registrations = registry.len(),
            grace_secs = config.grace.duration.as_secs(),
            "Warden started"
        );

        Ok(Warden {
            config,
            epoch,
            table,
            service,
            registry,
            grace,
            cleanup,
            notifier,
            admin,
            recovery: Mutex::new(Some(recovery)),
            recovery_abort,
            grace_watch,
        })
    }
}

/// A running lock manager.
pub struct Warden {
    config: WardenConfig,
    epoch: ServerEpoch,
    table: Arc<LockTable>,
    service: Arc<LockService>,
    registry: Arc<ClientRegistry>,
    grace: Arc<GracePeriod>,
    cleanup: Arc<CrashCleanup>,
    notifier: Arc<CrashNotifier>,
    admin: Arc<AdminHandler>,
    recovery: Mutex<Option<JoinHandle<Result<NotifyReport>>>>,
    recovery_abort: AbortHandle,
    grace_watch: JoinHandle<()>,
}

impl Warden {
    /// Start building a server from `config`.
    pub fn builder(config: WardenConfig) -> WardenBuilder {
        WardenBuilder {
            config,
            epoch_store: None,
            registration_store: None,
            transport: None,
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    /// Epoch of this incarnation.
    pub fn epoch(&self) -> ServerEpoch {
        self.epoch
    }

    /// Lock service for protocol front-ends.
    pub fn locks(&self) -> &Arc<LockService> {
        &self.service
    }

    /// Underlying lock table.
    pub fn table(&self) -> &Arc<LockTable> {
        &self.table
    }

    /// Client registry.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Grace period controller.
    pub fn grace(&self) -> &Arc<GracePeriod> {
        &self.grace
    }

    /// Crash cleanup.
    pub fn cleanup(&self) -> &Arc<CrashCleanup> {
        &self.cleanup
    }

    /// Restart notifier.
    pub fn notifier(&self) -> &Arc<CrashNotifier> {
        &self.notifier
    }

    /// Administrative handler.
    pub fn admin(&self) -> &Arc<AdminHandler> {
        &self.admin
    }

    /// Wait for the startup notification round to finish.
    ///
    /// Only the first caller receives the report.
    pub async fn recovery_complete(&self) -> Result<NotifyReport> {
        let handle = self.recovery.lock().take().ok_or_else(|| {
            WardenError::InvalidState("Recovery report already taken".into())
        })?;
        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(WardenError::InvalidState(
                "Notification round cancelled by shutdown".into(),
            )),
            Err(e) => Err(WardenError::Internal(format!("Notification round panicked: {}", e))),
        }
    }

    /// Stop background tasks, including a notification round in progress.
    pub fn shutdown(&self) {
        self.recovery_abort.abort();
        self.grace_watch.abort();
        info!(epoch = %self.epoch, "Warden stopped");
    }
}

fn open_epoch_store(config: &WardenConfig) -> Result<Arc<dyn EpochStore>> {
    if config.registry.backend == StoreBackend::Memory {
        return Ok(Arc::new(MemoryEpochStore::new()));
    }
    Ok(Arc::new(FileEpochStore::open(config.storage.epoch_path())?))
}

fn open_registration_store(config: &WardenConfig) -> Result<Arc<dyn RegistrationStore>> {
    match config.registry.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryRegistrationStore::new())),
        StoreBackend::File => Ok(Arc::new(FileRegistrationStore::open(
            config.storage.registry_path(),
        )?)),
        #[cfg(feature = "rocksdb")]
        StoreBackend::RocksDb => Ok(Arc::new(crate::registry::RocksRegistrationStore::open(
            config.storage.registry_path(),
        )?)),
        #[cfg(not(feature = "rocksdb"))]
        StoreBackend::RocksDb => Err(WardenError::Config(
            "RocksDB backend requires the `rocksdb` feature".into(),
        )),
    }
}

/// Flip the grace gauge off once the window closes.
fn spawn_grace_watch(grace: Arc<GracePeriod>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !grace.is_active() {
            return;
        }
        tokio::time::sleep_until(grace.deadline()).await;
        observability::set_grace_active(false);
        info!("Grace period ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallbackInfo, ClientId, OpaqueToken};
    use std::time::Duration;

    fn memory_config() -> WardenConfig {
        let mut config = WardenConfig::development();
        config.registry.backend = StoreBackend::Memory;
        config
    }

    #[tokio::test]
    async fn test_start_advances_epoch() {
        let epochs = Arc::new(MemoryEpochStore::with_epoch(41));
        let warden = Warden::builder(memory_config())
            .epoch_store(epochs.clone())
            .start()
            .await
            .unwrap();

        assert_eq!(warden.epoch().get(), 42);
        assert_eq!(epochs.load().unwrap(), Some(42));
        assert!(warden.grace().is_active());

        let report = warden.recovery_complete().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert!(warden.recovery_complete().await.is_err());
        warden.shutdown();
    }

    struct ReadOnlyEpochs;

    impl EpochStore for ReadOnlyEpochs {
        fn load(&self) -> Result<Option<u64>> {
            Ok(Some(1))
        }
        fn save(&self, _: u64) -> Result<()> {
            Err(WardenError::Persistence("read-only".into()))
        }
    }

    #[tokio::test]
    async fn test_epoch_persist_failure_is_fatal() {
        let result = Warden::builder(memory_config())
            .epoch_store(Arc::new(ReadOnlyEpochs))
            .start()
            .await;
        assert!(matches!(result, Err(WardenError::Persistence(_))));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_round_awaited_elsewhere() {
        let store = Arc::new(MemoryRegistrationStore::new());
        ClientRegistry::load(Default::default(), store.clone(), 1)
            .unwrap()
            .register(
                ClientId::new("slow"),
                "dev-node",
                CallbackInfo::new("slow:1"),
                OpaqueToken::new([2; 16]),
            )
            .unwrap();

        struct Silent;

        #[async_trait::async_trait]
        impl CallbackTransport for Silent {
            async fn send_notification(
                &self,
                _: &str,
                _: &crate::notify::StateChangeNotification,
                _: Duration,
            ) -> Result<()> {
                std::future::pending().await
            }
        }

        let mut config = memory_config();
        config.notifier.timeout = Duration::from_secs(3600);
        let warden = Arc::new(
            Warden::builder(config)
                .registration_store(store)
                .transport(Arc::new(Silent))
                .start()
                .await
                .unwrap(),
        );

        let waiting = {
            let warden = warden.clone();
            tokio::spawn(async move { warden.recovery_complete().await })
        };
        tokio::task::yield_now().await;
        warden.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(WardenError::InvalidState(_))));
        assert_eq!(warden.notifier().state(), crate::notify::NotifierState::Idle);
    }

    #[tokio::test]
    async fn test_registrations_loaded_before_notify() {
        let store = Arc::new(MemoryRegistrationStore::new());
        {
            let registry = ClientRegistry::load(Default::default(), store.clone(), 1).unwrap();
            registry
                .register(
                    ClientId::new("gone"),
                    "dev-node",
                    CallbackInfo::new("127.0.0.1:1"),
                    OpaqueToken::new([1; 16]),
                )
                .unwrap();
        }

        let mut config = memory_config();
        config.notifier.timeout = Duration::from_millis(500);
        let warden = Warden::builder(config)
            .registration_store(store)
            .start()
            .await
            .unwrap();

        let report = warden.recovery_complete().await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.failed, vec![ClientId::new("gone")]);
        assert!(warden.registry().is_empty());
    }
}
