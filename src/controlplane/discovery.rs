//! Discovery Orchestrator
//!
//! Registers storages and centralized managers:
//! - Deduplicates candidates against persisted access info, cleaning up
//!   records left behind by interrupted registrations
//! - Serializes registrations of one endpoint across replicas with a
//!   distributed lock held over probe and persist
//! - Runs best-effort post-registration steps once records are committed
//!
//! Removal dispatches teardown tasks and hands cleanup to the driver manager.

use crate::controlplane::sync::SyncOrchestrator;
use crate::coordination::with_lock;
use crate::domain::models::{AccessInfo, AccessInfoFilter, CentralizedManager, Storage};
use crate::domain::ports::{
    CredentialCipherRef, DatabaseRef, DistributedLockRef, TaskDispatcherRef,
};
use crate::drivers::{DriverLookup, DriverManager};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Maximum wait for the per-endpoint registration lock
    pub lock_timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 30,
        }
    }
}

impl DiscoveryConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

/// Name of the lock serializing registrations against `host`
pub fn registration_lock_name(host: &str) -> String {
    format!("storage-create-{}", host)
}

// =============================================================================
// Discovery Orchestrator
// =============================================================================

/// Registration and removal of storages
pub struct DiscoveryOrchestrator {
    config: DiscoveryConfig,
    drivers: Arc<DriverManager>,
    db: DatabaseRef,
    locks: DistributedLockRef,
    cipher: CredentialCipherRef,
    sync: Arc<SyncOrchestrator>,
    dispatcher: TaskDispatcherRef,
    metrics: Arc<Metrics>,
}

impl DiscoveryOrchestrator {
    /// Create a new discovery orchestrator
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DiscoveryConfig,
        drivers: Arc<DriverManager>,
        db: DatabaseRef,
        locks: DistributedLockRef,
        cipher: CredentialCipherRef,
        sync: Arc<SyncOrchestrator>,
        dispatcher: TaskDispatcherRef,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            drivers,
            db,
            locks,
            cipher,
            sync,
            dispatcher,
            metrics,
        })
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a directly managed storage
    pub async fn discover_single_storage(&self, access: AccessInfo) -> Result<Storage> {
        access.validate()?;
        let mut access = access.map_passwords(|p| self.cipher.encrypt(p))?;
        let host = access.primary_host()?.to_string();

        let result = self
            .locked(&host, move || async move {
                self.check_duplicate_access(&access, None).await?;

                let driver = self
                    .drivers
                    .get_driver(DriverLookup::Access(&access), false)
                    .await?;
                let mut storage = driver.get_storage().await?;
                self.check_duplicate_storage(&storage).await?;

                let storage_id = Uuid::new_v4().to_string();
                access.storage_id = storage_id.clone();
                access.driver_id = storage_id.clone();
                storage.id = storage_id;

                self.db.create_access_info(access).await?;
                self.db.create_storage(storage).await
            })
            .await;
        let storage = self.record_outcome(result)?;

        info!(
            storage_id = %storage.id,
            "Registered storage {} ({} {})", storage.serial_number, storage.vendor, storage.model
        );
        self.post_registration(&storage.id).await;
        Ok(storage)
    }

    /// Register a centralized manager and every storage behind it
    pub async fn discover_managed_storages(&self, access: AccessInfo) -> Result<CentralizedManager> {
        access.validate()?;
        let access = access.map_passwords(|p| self.cipher.encrypt(p))?;
        let host = access.primary_host()?.to_string();
        let derived_id = CentralizedManager::derive_id(&access);

        let result = self
            .locked(&host, move || async move {
                if let Some(cm) = self
                    .db
                    .find_centralized_manager_by_derived_id(&derived_id)
                    .await?
                {
                    return Err(Error::AlreadyRegistered {
                        reason: format!("centralized manager {} has the same endpoint", cm.id),
                    });
                }
                self.check_duplicate_access(&access, None).await?;

                let driver = self
                    .drivers
                    .get_driver(DriverLookup::Access(&access), false)
                    .await?;
                let reported = driver.get_storages().await?;
                if reported.is_empty() {
                    return Err(Error::DriverOperation {
                        driver: access.driver_name(),
                        operation: "get_storages".into(),
                        reason: "no storages reported".into(),
                    });
                }
                // Nothing is persisted unless every storage is new
                for storage in &reported {
                    self.check_duplicate_storage(storage).await?;
                }

                let cm_id = Uuid::new_v4().to_string();
                let mut storage_ids = Vec::with_capacity(reported.len());
                for mut storage in reported {
                    let storage_id = Uuid::new_v4().to_string();
                    let mut member = access.clone();
                    member.storage_id = storage_id.clone();
                    member.driver_id = cm_id.clone();
                    self.db.create_access_info(member).await?;

                    storage.id = storage_id.clone();
                    self.db.create_storage(storage).await?;
                    storage_ids.push(storage_id);
                }

                let mut own = access.clone();
                own.storage_id = cm_id.clone();
                own.driver_id = cm_id.clone();
                self.db.create_access_info(own).await?;

                self.db
                    .create_centralized_manager(CentralizedManager {
                        id: cm_id,
                        derived_id,
                        vendor: access.vendor.clone(),
                        model: access.model.clone(),
                        storages: storage_ids,
                        created_at: Utc::now(),
                    })
                    .await
            })
            .await;
        let cm = self.record_outcome(result)?;

        info!(
            cm_id = %cm.id,
            "Registered centralized manager with {} storage(s)", cm.storages.len()
        );
        for storage_id in &cm.storages {
            self.post_registration(storage_id).await;
        }
        Ok(cm)
    }

    /// Replace the credentials of a registered storage
    ///
    /// The endpoint is probed with the new credentials and must still report
    /// the same serial number. Members of a centralized manager share one
    /// credential set, so every record of the manager is updated.
    pub async fn update_access_info(&self, storage_id: &str, update: AccessInfo) -> Result<AccessInfo> {
        let existing = self.db.get_access_info(storage_id).await?;
        let storage = self.db.get_storage(storage_id).await?;

        let mut candidate = AccessInfo {
            storage_id: existing.storage_id.clone(),
            driver_id: existing.driver_id.clone(),
            vendor: existing.vendor.clone(),
            model: existing.model.clone(),
            rest: update.rest,
            ssh: update.ssh,
            smis: update.smis,
            extra_attributes: update.extra_attributes,
        };
        candidate.validate()?;
        candidate = candidate.map_passwords(|p| self.cipher.encrypt(p))?;
        let host = candidate.primary_host()?.to_string();
        let (candidate, storage) = (&candidate, &storage);
        let driver_id = existing.driver_id.as_str();

        self.locked(&host, move || async move {
            self.check_duplicate_access(candidate, Some(driver_id)).await?;

            let driver = self
                .drivers
                .get_driver(DriverLookup::Access(candidate), false)
                .await?;
            let probed = driver
                .get_storages()
                .await?
                .into_iter()
                .find(|s| s.serial_number == storage.serial_number)
                .ok_or_else(|| Error::StorageInconsistent {
                    storage_id: storage_id.to_string(),
                    reason: format!(
                        "endpoint does not report serial number {}",
                        storage.serial_number
                    ),
                })?;

            let sharing = if driver_id == storage_id {
                vec![storage_id.to_string()]
            } else {
                self.db
                    .list_access_infos(&AccessInfoFilter::by_driver_id(driver_id))
                    .await?
                    .into_iter()
                    .map(|a| a.storage_id)
                    .collect()
            };
            for id in &sharing {
                let mut record = candidate.clone();
                record.storage_id = id.clone();
                self.db.update_access_info(id, record).await?;
            }

            self.db
                .update_storage(
                    storage_id,
                    Storage {
                        id: storage.id.clone(),
                        ..probed
                    },
                )
                .await?;
            self.drivers.update_driver(driver_id, driver);
            Ok(())
        })
        .await?;

        info!(storage_id = %storage_id, "Updated access info");
        self.db.get_access_info(storage_id).await
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Remove one storage
    pub async fn remove_storage(&self, storage_id: &str) -> Result<()> {
        self.db.get_storage(storage_id).await?;
        self.teardown(storage_id).await;
        self.drivers.remove_storage(storage_id).await
    }

    /// Remove a centralized manager and every storage it owns
    ///
    /// A failure on one storage does not stop the others. The failed ids
    /// are reported together in one error.
    pub async fn remove_managed_storage(&self, cm_id: &str) -> Result<()> {
        let cm = self.db.get_centralized_manager(cm_id).await?;
        let mut failures = Vec::new();

        for storage_id in &cm.storages {
            self.teardown(storage_id).await;
            if let Err(e) = self.drivers.remove_storage(storage_id).await {
                error!(cm_id = %cm_id, storage_id = %storage_id, "Failed to remove storage: {}", e);
                self.metrics.record_step_failure("remove_storage");
                failures.push(format!("{}: {}", storage_id, e));
            }
        }

        if !failures.is_empty() {
            return Err(Error::Internal(format!(
                "failed to remove {} of {} storage(s) of centralized manager {}: {}",
                failures.len(),
                cm.storages.len(),
                cm_id,
                failures.join("; ")
            )));
        }

        self.drivers.release_driver(cm_id).await?;
        info!(cm_id = %cm_id, "Removed centralized manager and {} storage(s)", cm.storages.len());
        Ok(())
    }

    async fn teardown(&self, storage_id: &str) {
        if let Err(e) = self.sync.teardown(storage_id).await {
            error!(storage_id = %storage_id, "Teardown dispatch failed: {}", e);
            self.metrics.record_step_failure("teardown");
        }
    }

    // =========================================================================
    // Deduplication
    // =========================================================================

    /// Reject a candidate whose endpoint is already managed
    ///
    /// Matching records whose owner no longer exists are deleted. Records of
    /// `ignore_driver_id` are skipped.
    async fn check_duplicate_access(
        &self,
        candidate: &AccessInfo,
        ignore_driver_id: Option<&str>,
    ) -> Result<()> {
        let matches = self
            .db
            .list_access_infos(&candidate.connection_filter())
            .await?;

        for record in matches {
            if ignore_driver_id == Some(record.driver_id.as_str()) {
                continue;
            }
            if self.owner_exists(&record).await? {
                return Err(Error::AlreadyRegistered {
                    reason: format!(
                        "{} endpoint is already managed by {}",
                        candidate.driver_name(),
                        record.driver_id
                    ),
                });
            }
            debug!(
                storage_id = %record.storage_id,
                driver_id = %record.driver_id,
                "Deleting orphaned access info"
            );
            self.db.delete_access_info(&record.storage_id).await?;
        }
        Ok(())
    }

    async fn owner_exists(&self, record: &AccessInfo) -> Result<bool> {
        match self.db.get_storage(&record.storage_id).await {
            Ok(_) => return Ok(true),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        // A manager's own record is keyed by the manager id
        if record.storage_id == record.driver_id {
            match self.db.get_centralized_manager(&record.storage_id).await {
                Ok(_) => return Ok(true),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    async fn check_duplicate_storage(&self, candidate: &Storage) -> Result<()> {
        let existing = self.db.list_storages().await?;
        match existing.iter().find(|s| s.is_same_device(candidate)) {
            Some(s) => Err(Error::AlreadyRegistered {
                reason: format!(
                    "storage with serial number {} is registered as {}",
                    candidate.serial_number, s.id
                ),
            }),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Post-registration
    // =========================================================================

    /// Initial resource sync, alert sync and performance monitoring
    ///
    /// Each step runs regardless of the others. Failures are logged.
    async fn post_registration(&self, storage_id: &str) {
        if let Err(e) = self.sync.start_sync(storage_id).await {
            self.step_failed(storage_id, "resource_sync", &e);
        }

        if let Err(e) = self.dispatcher.dispatch_alert_sync(storage_id).await {
            self.step_failed(storage_id, "alert_sync", &e);
        }

        match self.enable_performance_monitoring(storage_id).await {
            Ok(()) => {}
            Err(e @ Error::EmptyResourceMetrics { .. }) => {
                info!(storage_id = %storage_id, "{}", e);
            }
            Err(e) => self.step_failed(storage_id, "performance_monitoring", &e),
        }
    }

    async fn enable_performance_monitoring(&self, storage_id: &str) -> Result<()> {
        let driver = self
            .drivers
            .get_driver(DriverLookup::Storage(storage_id), true)
            .await?;
        let capabilities = driver.get_capabilities().await?;
        capabilities.validate(storage_id)?;
        self.dispatcher
            .enable_performance_monitoring(storage_id, &capabilities)
            .await
    }

    fn step_failed(&self, storage_id: &str, step: &str, e: &Error) {
        error!(storage_id = %storage_id, step = %step, "Post-registration step failed: {}", e);
        self.metrics.record_step_failure(step);
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn locked<T, F, Fut>(&self, host: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let name = registration_lock_name(host);
        let result = with_lock(&self.locks, &name, self.config.lock_timeout(), f).await;
        let outcome = match &result {
            Err(Error::LockTimeout { .. }) => {
                warn!(lock = %name, "Registration lock not acquired");
                "timeout"
            }
            _ => "acquired",
        };
        self.metrics
            .lock_acquisitions
            .with_label_values(&[outcome])
            .inc();
        result
    }

    fn record_outcome<T>(&self, result: Result<T>) -> Result<T> {
        let outcome = match &result {
            Ok(_) => "registered",
            Err(Error::AlreadyRegistered { .. }) => "duplicate",
            Err(_) => "failed",
        };
        self.metrics.discoveries.with_label_values(&[outcome]).inc();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::sync::SyncConfig;
    use crate::coordination::LocalLockManager;
    use crate::db::MemoryDatabase;
    use crate::domain::cipher::Base64Cipher;
    use crate::domain::models::test_access_info;
    use crate::domain::ports::{
        AccessInfoStore, CentralizedManagerStore, CredentialCipher, StorageDriverRef,
        StorageStore, SyncStateStore,
    };
    use crate::drivers::fake::{fake_access_info, FakeDriverConfig, FakeDriverPlugin};
    use crate::drivers::{DriverManagerConfig, DriverPlugin, DriverRegistry, TlsOptions};
    use crate::metrics::test_metrics;
    use crate::tasks::dispatcher::{RecordingDispatcher, TaskMessage};
    use crate::tasks::KindCatalogue;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use sha2::{Digest, Sha256};

    /// Fake plugin registered under another vendor and model
    struct NamedPlugin {
        name: String,
        inner: Arc<FakeDriverPlugin>,
    }

    #[async_trait]
    impl DriverPlugin for NamedPlugin {
        fn name(&self) -> String {
            self.name.clone()
        }

        async fn connect(&self, access: &AccessInfo, tls: &TlsOptions) -> Result<StorageDriverRef> {
            self.inner.connect(access, tls).await
        }
    }

    struct Fixture {
        db: Arc<MemoryDatabase>,
        locks: Arc<LocalLockManager>,
        dispatcher: Arc<RecordingDispatcher>,
        plugin: Arc<FakeDriverPlugin>,
        drivers: Arc<DriverManager>,
        metrics: Arc<Metrics>,
        sync: Arc<SyncOrchestrator>,
        discovery: Arc<DiscoveryOrchestrator>,
    }

    fn fixture(config: FakeDriverConfig) -> Fixture {
        let plugin = Arc::new(FakeDriverPlugin::new(config));
        let registry = DriverRegistry::new();
        registry.register(plugin.clone()).unwrap();
        registry
            .register(Arc::new(NamedPlugin {
                name: "Dell EMC VMAX".into(),
                inner: plugin.clone(),
            }))
            .unwrap();

        let db = Arc::new(MemoryDatabase::new());
        let metrics = test_metrics();
        let locks = Arc::new(LocalLockManager::new());
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let drivers = DriverManager::new(
            DriverManagerConfig::default(),
            Arc::new(registry),
            db.clone(),
            Arc::new(Base64Cipher),
            metrics.clone(),
        );
        let sync = SyncOrchestrator::new(
            SyncConfig::default(),
            db.clone(),
            Arc::new(KindCatalogue::with_defaults()),
            dispatcher.clone(),
            metrics.clone(),
        );
        let discovery = DiscoveryOrchestrator::new(
            DiscoveryConfig {
                lock_timeout_secs: 1,
            },
            drivers.clone(),
            db.clone(),
            locks.clone(),
            Arc::new(Base64Cipher),
            sync.clone(),
            dispatcher.clone(),
            metrics.clone(),
        );
        Fixture {
            db,
            locks,
            dispatcher,
            plugin,
            drivers,
            metrics,
            sync,
            discovery,
        }
    }

    fn with_credentials(mut access: AccessInfo, username: &str, password: &str) -> AccessInfo {
        if let Some(rest) = access.rest.as_mut() {
            rest.username = username.into();
            rest.password = password.into();
        }
        access
    }

    async fn record_counts(db: &MemoryDatabase) -> (usize, usize, usize) {
        (
            db.list_access_infos(&AccessInfoFilter::default())
                .await
                .unwrap()
                .len(),
            db.list_storages().await.unwrap().len(),
            db.list_centralized_managers().await.unwrap().len(),
        )
    }

    #[tokio::test]
    async fn test_duplicate_managed_registration_rejected() {
        let f = fixture(FakeDriverConfig::default());
        let access = test_access_info("10.0.0.5", 8443);

        let cm = f
            .discovery
            .discover_managed_storages(with_credentials(access.clone(), "admin", "one"))
            .await
            .unwrap();
        let expected: String = Sha256::digest(b"Dell EMCVMAX10.0.0.58443")
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        assert_eq!(cm.derived_id, expected);
        let before = record_counts(&f.db).await;
        assert_eq!(before, (2, 1, 1));

        assert_matches!(
            f.discovery
                .discover_managed_storages(with_credentials(access, "operator", "two"))
                .await,
            Err(Error::AlreadyRegistered { .. })
        );
        assert_eq!(record_counts(&f.db).await, before);
        assert!(!f.locks.is_held("storage-create-10.0.0.5"));
    }

    #[tokio::test]
    async fn test_duplicate_single_registration_rejected() {
        let f = fixture(FakeDriverConfig::default());
        let access = fake_access_info("10.0.0.7", 8088);

        f.discovery
            .discover_single_storage(with_credentials(access.clone(), "a", "1"))
            .await
            .unwrap();
        assert_matches!(
            f.discovery
                .discover_single_storage(with_credentials(access, "b", "2"))
                .await,
            Err(Error::AlreadyRegistered { .. })
        );
        assert_eq!(record_counts(&f.db).await, (1, 1, 0));
        assert_eq!(
            f.metrics.discoveries.with_label_values(&["duplicate"]).get(),
            1
        );
    }

    #[tokio::test]
    async fn test_same_serial_on_other_endpoint_rejected() {
        let f = fixture(FakeDriverConfig {
            serial_prefix: Some("ARRAY".into()),
            ..Default::default()
        });
        f.discovery
            .discover_single_storage(fake_access_info("10.0.0.7", 8088))
            .await
            .unwrap();

        assert_matches!(
            f.discovery
                .discover_single_storage(fake_access_info("10.0.0.8", 8088))
                .await,
            Err(Error::AlreadyRegistered { .. })
        );
        assert_eq!(record_counts(&f.db).await, (1, 1, 0));
    }

    #[tokio::test]
    async fn test_orphaned_access_info_cleaned_up() {
        let f = fixture(FakeDriverConfig::default());
        let storage = f
            .discovery
            .discover_single_storage(fake_access_info("10.0.0.7", 8088))
            .await
            .unwrap();

        // Owner disappears out of band
        f.db.delete_storage(&storage.id).await.unwrap();

        let registered = f
            .discovery
            .discover_single_storage(with_credentials(
                fake_access_info("10.0.0.7", 8088),
                "other",
                "other",
            ))
            .await
            .unwrap();

        assert_matches!(
            f.db.get_access_info(&storage.id).await,
            Err(Error::AccessInfoNotFound { .. })
        );
        assert!(f.db.get_access_info(&registered.id).await.is_ok());
        assert_eq!(record_counts(&f.db).await, (1, 1, 0));
    }

    #[tokio::test]
    async fn test_post_registration_failures_are_isolated() {
        let f = fixture(FakeDriverConfig {
            storage_count: 3,
            ..Default::default()
        });
        f.dispatcher.fail_nth("alert_sync", 2);

        let cm = f
            .discovery
            .discover_managed_storages(fake_access_info("10.0.0.9", 8088))
            .await
            .unwrap();

        assert_eq!(cm.storages.len(), 3);
        assert_eq!(record_counts(&f.db).await, (4, 3, 1));

        let alerted: Vec<String> = f
            .dispatcher
            .sent_of("alert_sync")
            .iter()
            .map(|m| m.storage_id().to_string())
            .collect();
        assert_eq!(alerted, vec![cm.storages[0].clone(), cm.storages[2].clone()]);
        assert_eq!(
            f.metrics
                .best_effort_failures
                .with_label_values(&["alert_sync"])
                .get(),
            1
        );
        // Every storage still synced and enabled monitoring
        assert_eq!(f.dispatcher.sent_of("resource_sync").len(), 27);
        assert_eq!(f.dispatcher.sent_of("enable_performance_monitoring").len(), 3);
    }

    #[tokio::test]
    async fn test_empty_metrics_is_not_a_failure() {
        let f = fixture(FakeDriverConfig {
            with_metrics: false,
            ..Default::default()
        });
        f.discovery
            .discover_single_storage(fake_access_info("10.0.0.7", 8088))
            .await
            .unwrap();

        assert!(f.dispatcher.sent_of("enable_performance_monitoring").is_empty());
        assert_eq!(
            f.metrics
                .best_effort_failures
                .with_label_values(&["performance_monitoring"])
                .get(),
            0
        );
    }

    #[tokio::test]
    async fn test_lock_released_when_probe_fails() {
        let f = fixture(FakeDriverConfig::default());
        f.plugin.set_fail_connect(true);

        assert_matches!(
            f.discovery
                .discover_managed_storages(fake_access_info("10.0.0.9", 8088))
                .await,
            Err(Error::DriverOperation { .. })
        );
        assert!(!f.locks.is_held("storage-create-10.0.0.9"));
        assert_eq!(record_counts(&f.db).await, (0, 0, 0));

        f.plugin.set_fail_connect(false);
        let cm = f
            .discovery
            .discover_managed_storages(fake_access_info("10.0.0.9", 8088))
            .await
            .unwrap();
        assert_eq!(cm.storages.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_registration_releases_lock() {
        let f = fixture(FakeDriverConfig {
            connect_delay: Duration::from_millis(200),
            ..Default::default()
        });

        let attempt = f
            .discovery
            .discover_single_storage(fake_access_info("10.0.0.9", 8088));
        assert!(tokio::time::timeout(Duration::from_millis(50), attempt)
            .await
            .is_err());
        assert_eq!(record_counts(&f.db).await, (0, 0, 0));

        let storage = f
            .discovery
            .discover_single_storage(fake_access_info("10.0.0.9", 8088))
            .await
            .unwrap();
        assert_eq!(storage.serial_number, "FAKE-10.0.0.9-8088-000");
        assert!(!f.locks.is_held("storage-create-10.0.0.9"));
    }

    #[tokio::test]
    async fn test_registration_waits_for_busy_endpoint() {
        use crate::domain::ports::DistributedLock;

        let f = fixture(FakeDriverConfig::default());
        let handle = f
            .locks
            .acquire("storage-create-10.0.0.9", Duration::from_millis(50))
            .await
            .unwrap();

        assert_matches!(
            f.discovery
                .discover_single_storage(fake_access_info("10.0.0.9", 8088))
                .await,
            Err(Error::LockTimeout { .. })
        );
        assert_eq!(f.plugin.constructions(), 0);

        f.locks.release(handle).await.unwrap();
        assert!(f
            .discovery
            .discover_single_storage(fake_access_info("10.0.0.9", 8088))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_registration_starts_single_sync() {
        let f = fixture(FakeDriverConfig::default());
        let storage = f
            .discovery
            .discover_single_storage(fake_access_info("10.0.0.7", 8088))
            .await
            .unwrap();

        assert!(f.db.get_sync_state(&storage.id).await.unwrap().is_syncing);
        assert_matches!(
            f.sync.start_sync(&storage.id).await,
            Err(Error::SyncAlreadyInProgress { .. })
        );
        assert_eq!(f.dispatcher.sent_of("resource_sync").len(), 9);
    }

    #[tokio::test]
    async fn test_update_access_info_checks_serial() {
        let f = fixture(FakeDriverConfig::default());
        let storage = f
            .discovery
            .discover_single_storage(fake_access_info("10.0.0.7", 8088))
            .await
            .unwrap();

        // Another host reports another serial number
        assert_matches!(
            f.discovery
                .update_access_info(&storage.id, fake_access_info("10.0.0.8", 8088))
                .await,
            Err(Error::StorageInconsistent { .. })
        );

        let updated = f
            .discovery
            .update_access_info(
                &storage.id,
                with_credentials(fake_access_info("10.0.0.7", 8088), "admin", "rotated"),
            )
            .await
            .unwrap();
        let rest = updated.rest.unwrap();
        assert_eq!(Base64Cipher.decrypt(&rest.password).unwrap(), "rotated");
        assert_eq!(updated.driver_id, storage.id);
        assert_eq!(f.drivers.cached_driver_ids(), vec![storage.id.clone()]);
    }

    #[tokio::test]
    async fn test_update_access_info_updates_every_member() {
        let f = fixture(FakeDriverConfig {
            storage_count: 2,
            serial_prefix: Some("ARRAY".into()),
            ..Default::default()
        });
        let cm = f
            .discovery
            .discover_managed_storages(fake_access_info("10.0.0.9", 8088))
            .await
            .unwrap();

        f.discovery
            .update_access_info(&cm.storages[0], fake_access_info("10.0.0.10", 8088))
            .await
            .unwrap();

        let moved = f
            .db
            .list_access_infos(&AccessInfoFilter::by_driver_id(&cm.id))
            .await
            .unwrap();
        assert_eq!(moved.len(), 3);
        assert!(moved
            .iter()
            .all(|a| a.rest.as_ref().map(|r| r.host.as_str()) == Some("10.0.0.10")));
    }

    #[tokio::test]
    async fn test_remove_managed_storage() {
        let f = fixture(FakeDriverConfig {
            storage_count: 3,
            ..Default::default()
        });
        let cm = f
            .discovery
            .discover_managed_storages(fake_access_info("10.0.0.9", 8088))
            .await
            .unwrap();
        assert_eq!(f.drivers.cached_driver_ids(), vec![cm.id.clone()]);
        f.dispatcher.fail_on("resource_teardown", &cm.storages[0]);

        f.discovery.remove_managed_storage(&cm.id).await.unwrap();

        assert_eq!(record_counts(&f.db).await, (0, 0, 0));
        assert!(f.drivers.cached_driver_ids().is_empty());
        // Storage #1's failure did not stop the others
        assert_eq!(f.dispatcher.sent_of("resource_teardown").len(), 18);
        assert_eq!(f.dispatcher.sent_of("telemetry_teardown").len(), 3);
        assert_eq!(
            f.metrics
                .best_effort_failures
                .with_label_values(&["teardown"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_remove_managed_storage_continues_past_failure() {
        let f = fixture(FakeDriverConfig {
            storage_count: 3,
            ..Default::default()
        });
        let cm = f
            .discovery
            .discover_managed_storages(fake_access_info("10.0.0.9", 8088))
            .await
            .unwrap();
        let stuck = cm.storages[0].clone();
        f.db.fail_delete_of(&stuck);

        let err = f.discovery.remove_managed_storage(&cm.id).await.unwrap_err();
        assert_matches!(&err, Error::Internal(msg) if msg.contains(&stuck));

        // The other storages are still removed
        let remaining = f.db.list_storages().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, stuck);
        assert_eq!(f.dispatcher.sent_of("telemetry_teardown").len(), 3);
        assert_eq!(
            f.metrics
                .best_effort_failures
                .with_label_values(&["remove_storage"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_remove_single_storage() {
        let f = fixture(FakeDriverConfig::default());
        let storage = f
            .discovery
            .discover_single_storage(fake_access_info("10.0.0.7", 8088))
            .await
            .unwrap();

        f.discovery.remove_storage(&storage.id).await.unwrap();
        assert_eq!(record_counts(&f.db).await, (0, 0, 0));
        assert!(f.drivers.cached_driver_ids().is_empty());
        assert!(f
            .dispatcher
            .sent()
            .iter()
            .any(|m| matches!(m, TaskMessage::TelemetryTeardown { storage_id, .. } if *storage_id == storage.id)));

        assert_matches!(
            f.discovery.remove_storage(&storage.id).await,
            Err(Error::StorageNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_invalid_access_rejected_before_lock() {
        let f = fixture(FakeDriverConfig::default());
        let mut access = fake_access_info("10.0.0.7", 8088);
        access.rest = None;

        assert_matches!(
            f.discovery.discover_single_storage(access).await,
            Err(Error::InvalidAccessInfo(_))
        );
        assert_eq!(
            f.metrics
                .lock_acquisitions
                .with_label_values(&["acquired"])
                .get(),
            0
        );
    }
}
