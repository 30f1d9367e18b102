//! Driver Manager
//!
//! Process-wide cache of connected driver sessions keyed by `driver_id`.
//! Storages behind one centralized manager share the manager's session.
//!
//! Construction is linearized per `driver_id`: the cache is checked, a
//! per-id async lock is taken, the cache is checked again, and only then is
//! the plugin asked to connect. Constructions for different ids run
//! concurrently.

use crate::domain::models::{AccessInfo, AccessInfoFilter};
use crate::domain::ports::{CredentialCipherRef, DatabaseRef, StorageDriverRef};
use crate::drivers::ssl::{self, CaBundle, TlsOptions};
use crate::drivers::DriverRegistry;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the driver manager
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverManagerConfig {
    /// CA file or directory used to verify endpoints; unset disables
    /// verification
    pub ca_path: Option<PathBuf>,
}

/// How the caller identifies the driver it wants
#[derive(Debug, Clone, Copy)]
pub enum DriverLookup<'a> {
    /// A registered storage; its persisted access info names the session
    Storage(&'a str),
    /// Explicit access info, passwords encrypted
    Access(&'a AccessInfo),
}

// =============================================================================
// Driver Manager
// =============================================================================

/// Registry front-end and instance cache
pub struct DriverManager {
    config: DriverManagerConfig,
    registry: Arc<DriverRegistry>,
    db: DatabaseRef,
    cipher: CredentialCipherRef,
    metrics: Arc<Metrics>,
    /// Live sessions by driver_id
    instances: DashMap<String, StorageDriverRef>,
    /// Construction locks by driver_id
    construct_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl DriverManager {
    pub fn new(
        config: DriverManagerConfig,
        registry: Arc<DriverRegistry>,
        db: DatabaseRef,
        cipher: CredentialCipherRef,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            db,
            cipher,
            metrics,
            instances: DashMap::new(),
            construct_locks: DashMap::new(),
        })
    }

    /// Get the plugin registry
    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    /// Get a connected driver
    ///
    /// With `cache_on_load == false` a fresh session is built and never
    /// stored. Otherwise a cached session is returned unchanged, or built
    /// exactly once and cached.
    pub async fn get_driver(
        &self,
        lookup: DriverLookup<'_>,
        cache_on_load: bool,
    ) -> Result<StorageDriverRef> {
        self.verify_ca_path()?;

        let access = match lookup {
            DriverLookup::Access(access) => access.clone(),
            DriverLookup::Storage(storage_id) => self.db.get_access_info(storage_id).await?,
        };

        if !cache_on_load {
            return self.construct(&access).await;
        }

        let driver_id = driver_key(&access)?;
        if let Some(driver) = self.cached(&driver_id) {
            return Ok(driver);
        }

        let lock = self.construct_lock(&driver_id);
        let _guard = lock.lock().await;

        if let Some(driver) = self.cached(&driver_id) {
            return Ok(driver);
        }

        let driver = self.construct(&access).await?;
        self.instances.insert(driver_id.clone(), driver.clone());
        self.refresh_gauge();
        info!(driver_id = %driver_id, "Cached driver for {}", access.driver_name());

        Ok(driver)
    }

    /// Replace the cached session for `driver_id`
    pub fn update_driver(&self, driver_id: &str, driver: StorageDriverRef) {
        self.instances.insert(driver_id.to_string(), driver);
        self.refresh_gauge();
        debug!(driver_id = %driver_id, "Replaced cached driver");
    }

    /// Drop the cached session, if any
    pub fn evict(&self, driver_id: &str) {
        if self.instances.remove(driver_id).is_some() {
            self.refresh_gauge();
            debug!(driver_id = %driver_id, "Evicted cached driver");
        }
    }

    /// Ids with a live session, sorted
    pub fn cached_driver_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Forget a storage's credentials, record and sync state
    ///
    /// When the storage was the last member of a centralized manager, the
    /// manager's session, record and credentials go too.
    pub async fn remove_storage(&self, storage_id: &str) -> Result<()> {
        let access = match self.db.get_access_info(storage_id).await {
            Ok(access) => Some(access),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        self.db.delete_access_info(storage_id).await?;
        self.db.delete_storage(storage_id).await?;
        self.db.clear_sync_state(storage_id).await?;

        let driver_id = match access.as_ref().map(driver_key).transpose()? {
            Some(id) => id,
            None => {
                self.evict(storage_id);
                return Ok(());
            }
        };

        if driver_id == storage_id {
            self.release_driver(&driver_id).await?;
            info!(storage_id = %storage_id, "Removed storage");
            return Ok(());
        }

        let members = self
            .db
            .list_access_infos(&AccessInfoFilter::by_driver_id(&driver_id))
            .await?
            .into_iter()
            .filter(|a| a.storage_id != driver_id)
            .count();

        if members == 0 {
            self.release_driver(&driver_id).await?;
        } else {
            match self.db.get_centralized_manager(&driver_id).await {
                Ok(mut cm) => {
                    cm.storages.retain(|id| id != storage_id);
                    self.db.update_centralized_manager(cm).await?;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        info!(storage_id = %storage_id, driver_id = %driver_id, "Removed storage");
        Ok(())
    }

    /// Evict the session for `driver_id` and delete the centralized
    /// manager it belongs to, if any
    ///
    /// Waits for an in-flight construction of the same id, so the session it
    /// produces is evicted as well. The construction lock entry is kept.
    pub async fn release_driver(&self, driver_id: &str) -> Result<()> {
        {
            let lock = self.construct_lock(driver_id);
            let _guard = lock.lock().await;
            self.evict(driver_id);
        }

        match self.db.get_centralized_manager(driver_id).await {
            Ok(cm) => {
                self.db.delete_access_info(&cm.id).await?;
                self.db.delete_centralized_manager(&cm.id).await?;
                info!(cm_id = %cm.id, "Removed centralized manager");
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    // =========================================================================
    // Construction
    // =========================================================================

    fn construct_lock(&self, driver_id: &str) -> Arc<AsyncMutex<()>> {
        self.construct_locks
            .entry(driver_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn cached(&self, driver_id: &str) -> Option<StorageDriverRef> {
        self.instances.get(driver_id).map(|e| e.value().clone())
    }

    async fn construct(&self, access: &AccessInfo) -> Result<StorageDriverRef> {
        let plugin = self
            .registry
            .resolve_driver_class(&access.vendor, &access.model)?;
        let tls = self.tls_options()?;
        let decrypted = access.map_passwords(|p| self.cipher.decrypt(p))?;

        let driver = plugin.connect(&decrypted, &tls).await?;
        self.metrics.driver_constructions.inc();
        debug!("Constructed driver {}", plugin.name());
        Ok(driver)
    }

    fn verify_ca_path(&self) -> Result<()> {
        match &self.config.ca_path {
            Some(path) => ssl::verify_ca_path(path),
            None => Ok(()),
        }
    }

    fn tls_options(&self) -> Result<TlsOptions> {
        match &self.config.ca_path {
            Some(path) => Ok(TlsOptions::with_bundle(CaBundle::load(path)?)),
            None => Ok(TlsOptions::insecure()),
        }
    }

    fn refresh_gauge(&self) {
        self.metrics.driver_instances.set(self.instances.len() as i64);
    }
}

impl std::fmt::Debug for DriverManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverManager")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("cached", &self.cached_driver_ids())
            .finish()
    }
}

/// Cache key of an access record
fn driver_key(access: &AccessInfo) -> Result<String> {
    if !access.driver_id.is_empty() {
        Ok(access.driver_id.clone())
    } else if !access.storage_id.is_empty() {
        Ok(access.storage_id.clone())
    } else {
        Err(Error::InvalidAccessInfo(
            "access info carries neither driver_id nor storage_id".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;
    use crate::domain::cipher::Base64Cipher;
    use crate::domain::models::CentralizedManager;
    use crate::domain::ports::CredentialCipher;
    use crate::drivers::fake::{fake_access_info, FakeDriverConfig, FakeDriverPlugin};
    use crate::drivers::DriverPlugin;
    use crate::metrics::test_metrics;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::time::Duration;

    fn manager_with(
        plugin: Arc<FakeDriverPlugin>,
        config: DriverManagerConfig,
    ) -> (Arc<DriverManager>, Arc<MemoryDatabase>) {
        let registry = DriverRegistry::new();
        registry.register(plugin).unwrap();
        let db = Arc::new(MemoryDatabase::new());
        let manager = DriverManager::new(
            config,
            Arc::new(registry),
            db.clone(),
            Arc::new(Base64Cipher),
            test_metrics(),
        );
        (manager, db)
    }

    fn encrypted(host: &str, storage_id: &str, driver_id: &str) -> AccessInfo {
        let mut info = fake_access_info(host, 8088)
            .map_passwords(|p| Base64Cipher.encrypt(p))
            .unwrap();
        info.storage_id = storage_id.into();
        info.driver_id = driver_id.into();
        info
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_driver_constructs_once() {
        let plugin = Arc::new(FakeDriverPlugin::new(FakeDriverConfig {
            connect_delay: Duration::from_millis(50),
            ..Default::default()
        }));
        let (manager, _db) = manager_with(plugin.clone(), DriverManagerConfig::default());
        let access = encrypted("10.0.0.1", "st-1", "st-1");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            let access = access.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .get_driver(DriverLookup::Access(&access), true)
                    .await
                    .unwrap()
            }));
        }

        let mut drivers = Vec::new();
        for handle in handles {
            drivers.push(handle.await.unwrap());
        }

        assert_eq!(plugin.constructions(), 1);
        assert_eq!(plugin.peak_concurrent_connects(), 1);
        assert!(drivers.iter().all(|d| Arc::ptr_eq(d, &drivers[0])));
        assert_eq!(manager.cached_driver_ids(), vec!["st-1".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_release_waits_for_inflight_construction() {
        use crate::domain::ports::AccessInfoStore;

        let plugin = Arc::new(FakeDriverPlugin::new(FakeDriverConfig {
            connect_delay: Duration::from_millis(200),
            ..Default::default()
        }));
        let (manager, db) = manager_with(plugin.clone(), DriverManagerConfig::default());
        let access = encrypted("10.0.0.1", "st-1", "st-1");
        db.create_access_info(access.clone()).await.unwrap();

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .get_driver(DriverLookup::Storage("st-1"), true)
                    .await
                    .map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let release = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.release_driver("st-1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .get_driver(DriverLookup::Access(&access), true)
                    .await
                    .map(|_| ())
            })
        };

        first.await.unwrap().unwrap();
        release.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(plugin.peak_concurrent_connects(), 1);
        assert_eq!(plugin.constructions(), 2);
        assert_eq!(manager.cached_driver_ids(), vec!["st-1".to_string()]);
    }

    #[tokio::test]
    async fn test_release_evicts_session_built_during_release() {
        use crate::domain::ports::AccessInfoStore;

        let plugin = Arc::new(FakeDriverPlugin::new(FakeDriverConfig {
            connect_delay: Duration::from_millis(100),
            ..Default::default()
        }));
        let (manager, db) = manager_with(plugin.clone(), DriverManagerConfig::default());
        db.create_access_info(encrypted("10.0.0.1", "st-1", "st-1"))
            .await
            .unwrap();

        let building = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .get_driver(DriverLookup::Storage("st-1"), true)
                    .await
                    .map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.release_driver("st-1").await.unwrap();
        building.await.unwrap().unwrap();

        assert!(manager.cached_driver_ids().is_empty());
    }

    #[tokio::test]
    async fn test_distinct_driver_ids_get_distinct_sessions() {
        let plugin = Arc::new(FakeDriverPlugin::default());
        let (manager, _db) = manager_with(plugin.clone(), DriverManagerConfig::default());

        let a = encrypted("10.0.0.1", "st-a", "st-a");
        let b = encrypted("10.0.0.2", "st-b", "st-b");
        let (da, db_) = tokio::join!(
            manager.get_driver(DriverLookup::Access(&a), true),
            manager.get_driver(DriverLookup::Access(&b), true)
        );

        assert!(!Arc::ptr_eq(&da.unwrap(), &db_.unwrap()));
        assert_eq!(plugin.constructions(), 2);
    }

    #[tokio::test]
    async fn test_uncached_lookup_never_stores() {
        let plugin = Arc::new(FakeDriverPlugin::default());
        let (manager, _db) = manager_with(plugin.clone(), DriverManagerConfig::default());
        let access = encrypted("10.0.0.1", "", "");

        manager
            .get_driver(DriverLookup::Access(&access), false)
            .await
            .unwrap();
        manager
            .get_driver(DriverLookup::Access(&access), false)
            .await
            .unwrap();

        assert_eq!(plugin.constructions(), 2);
        assert!(manager.cached_driver_ids().is_empty());
    }

    #[tokio::test]
    async fn test_storage_lookup_uses_persisted_driver_id() {
        let plugin = Arc::new(FakeDriverPlugin::default());
        let (manager, db) = manager_with(plugin.clone(), DriverManagerConfig::default());
        use crate::domain::ports::AccessInfoStore;
        db.create_access_info(encrypted("10.0.0.1", "st-1", "cm-1"))
            .await
            .unwrap();
        db.create_access_info(encrypted("10.0.0.1", "st-2", "cm-1"))
            .await
            .unwrap();

        let d1 = manager
            .get_driver(DriverLookup::Storage("st-1"), true)
            .await
            .unwrap();
        let d2 = manager
            .get_driver(DriverLookup::Storage("st-2"), true)
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&d1, &d2));
        assert_eq!(manager.cached_driver_ids(), vec!["cm-1".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_storage_fails() {
        let (manager, _db) =
            manager_with(Arc::new(FakeDriverPlugin::default()), DriverManagerConfig::default());
        assert_matches!(
            manager.get_driver(DriverLookup::Storage("missing"), true).await.map(|_| ()),
            Err(Error::AccessInfoNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_evict_forces_reconstruction() {
        let plugin = Arc::new(FakeDriverPlugin::default());
        let (manager, _db) = manager_with(plugin.clone(), DriverManagerConfig::default());
        let access = encrypted("10.0.0.1", "st-1", "st-1");

        manager.evict("st-1");
        manager
            .get_driver(DriverLookup::Access(&access), true)
            .await
            .unwrap();
        manager.evict("st-1");
        assert!(manager.cached_driver_ids().is_empty());

        manager
            .get_driver(DriverLookup::Access(&access), true)
            .await
            .unwrap();
        assert_eq!(plugin.constructions(), 2);
    }

    #[tokio::test]
    async fn test_missing_ca_path_fails_before_construction() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = Arc::new(FakeDriverPlugin::default());
        let (manager, _db) = manager_with(
            plugin.clone(),
            DriverManagerConfig {
                ca_path: Some(dir.path().join("missing.pem")),
            },
        );
        let access = encrypted("10.0.0.1", "st-1", "st-1");

        assert_matches!(
            manager.get_driver(DriverLookup::Access(&access), true).await.map(|_| ()),
            Err(Error::Certificate { .. })
        );
        assert_eq!(plugin.constructions(), 0);
    }

    #[tokio::test]
    async fn test_valid_ca_bundle_allows_construction() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.pem");
        std::fs::write(&ca, crate::drivers::ssl::test_pem(b"root-ca")).unwrap();

        let plugin = Arc::new(FakeDriverPlugin::default());
        let (manager, _db) = manager_with(
            plugin.clone(),
            DriverManagerConfig { ca_path: Some(ca) },
        );
        let access = encrypted("10.0.0.1", "st-1", "st-1");

        assert!(manager
            .get_driver(DriverLookup::Access(&access), true)
            .await
            .is_ok());
    }

    struct PasswordProbe {
        seen: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DriverPlugin for PasswordProbe {
        fn name(&self) -> String {
            "fake_storage fake_driver".into()
        }

        async fn connect(&self, access: &AccessInfo, tls: &TlsOptions) -> Result<StorageDriverRef> {
            if let Some(rest) = &access.rest {
                self.seen.lock().push(rest.password.clone());
            }
            FakeDriverPlugin::default().connect(access, tls).await
        }
    }

    #[tokio::test]
    async fn test_plugin_receives_decrypted_password() {
        let probe = Arc::new(PasswordProbe {
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let registry = DriverRegistry::new();
        registry.register(probe.clone()).unwrap();
        let manager = DriverManager::new(
            DriverManagerConfig::default(),
            Arc::new(registry),
            Arc::new(MemoryDatabase::new()),
            Arc::new(Base64Cipher),
            test_metrics(),
        );

        let access = encrypted("10.0.0.1", "st-1", "st-1");
        let driver = manager
            .get_driver(DriverLookup::Access(&access), false)
            .await
            .unwrap();
        assert!(driver.get_storage().await.is_ok());
        assert_eq!(*probe.seen.lock(), vec!["secret".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_last_member_removes_centralized_manager() {
        use crate::domain::ports::{AccessInfoStore, CentralizedManagerStore};

        let plugin = Arc::new(FakeDriverPlugin::default());
        let (manager, db) = manager_with(plugin, DriverManagerConfig::default());

        db.create_access_info(encrypted("10.0.0.1", "cm-1", "cm-1"))
            .await
            .unwrap();
        for id in ["st-1", "st-2"] {
            db.create_access_info(encrypted("10.0.0.1", id, "cm-1"))
                .await
                .unwrap();
        }
        db.create_centralized_manager(CentralizedManager {
            id: "cm-1".into(),
            derived_id: "d".into(),
            vendor: "fake_storage".into(),
            model: "fake_driver".into(),
            storages: vec!["st-1".into(), "st-2".into()],
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
        manager
            .get_driver(DriverLookup::Storage("st-1"), true)
            .await
            .unwrap();

        manager.remove_storage("st-1").await.unwrap();
        let cm = db.get_centralized_manager("cm-1").await.unwrap();
        assert_eq!(cm.storages, vec!["st-2".to_string()]);
        assert_eq!(manager.cached_driver_ids(), vec!["cm-1".to_string()]);

        manager.remove_storage("st-2").await.unwrap();
        assert_matches!(
            db.get_centralized_manager("cm-1").await,
            Err(Error::CentralizedManagerNotFound { .. })
        );
        assert_matches!(
            db.get_access_info("cm-1").await,
            Err(Error::AccessInfoNotFound { .. })
        );
        assert!(manager.cached_driver_ids().is_empty());
    }

    #[tokio::test]
    async fn test_update_driver_replaces_instance() {
        let plugin = Arc::new(FakeDriverPlugin::default());
        let (manager, _db) = manager_with(plugin.clone(), DriverManagerConfig::default());
        let access = encrypted("10.0.0.1", "st-1", "st-1");

        let first = manager
            .get_driver(DriverLookup::Access(&access), true)
            .await
            .unwrap();
        let fresh = manager
            .get_driver(DriverLookup::Access(&access), false)
            .await
            .unwrap();
        manager.update_driver("st-1", fresh.clone());

        let cached = manager
            .get_driver(DriverLookup::Access(&access), true)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&cached, &fresh));
        assert!(!Arc::ptr_eq(&cached, &first));
    }
}
