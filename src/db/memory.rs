//! In-Memory Database
//!
//! Implements every store port over `parking_lot` guarded maps. Used by the
//! standalone binary and by tests. Records do not survive a restart.

use crate::domain::models::{AccessInfo, AccessInfoFilter, CentralizedManager, Storage, SyncState};
use crate::domain::ports::{
    AccessInfoStore, CentralizedManagerStore, StorageStore, SyncStateStore,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::warn;

/// Record store held in process memory
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    access_infos: RwLock<BTreeMap<String, AccessInfo>>,
    storages: RwLock<BTreeMap<String, Storage>>,
    centralized_managers: RwLock<BTreeMap<String, CentralizedManager>>,
    /// Guarded by one mutex so test-and-set is atomic
    sync_states: Mutex<HashMap<String, SyncState>>,
    /// Storage ids whose deletion fails, for exercising partial failures
    failing_deletes: Mutex<HashSet<String>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn fail_delete_of(&self, storage_id: &str) {
        self.failing_deletes.lock().insert(storage_id.to_string());
    }
}

// =============================================================================
// Access Info
// =============================================================================

#[async_trait]
impl AccessInfoStore for MemoryDatabase {
    async fn get_access_info(&self, storage_id: &str) -> Result<AccessInfo> {
        self.access_infos
            .read()
            .get(storage_id)
            .cloned()
            .ok_or_else(|| Error::AccessInfoNotFound {
                storage_id: storage_id.to_string(),
            })
    }

    async fn list_access_infos(&self, filter: &AccessInfoFilter) -> Result<Vec<AccessInfo>> {
        Ok(self
            .access_infos
            .read()
            .values()
            .filter(|info| filter.matches(info))
            .cloned()
            .collect())
    }

    async fn create_access_info(&self, info: AccessInfo) -> Result<AccessInfo> {
        let mut access_infos = self.access_infos.write();
        if access_infos.contains_key(&info.storage_id) {
            return Err(Error::AlreadyRegistered {
                reason: format!("access info for {} already exists", info.storage_id),
            });
        }
        access_infos.insert(info.storage_id.clone(), info.clone());
        Ok(info)
    }

    async fn update_access_info(&self, storage_id: &str, mut info: AccessInfo) -> Result<AccessInfo> {
        let mut access_infos = self.access_infos.write();
        let slot = access_infos
            .get_mut(storage_id)
            .ok_or_else(|| Error::AccessInfoNotFound {
                storage_id: storage_id.to_string(),
            })?;
        info.storage_id = storage_id.to_string();
        *slot = info.clone();
        Ok(info)
    }

    async fn delete_access_info(&self, storage_id: &str) -> Result<()> {
        self.access_infos.write().remove(storage_id);
        Ok(())
    }
}

// =============================================================================
// Storage
// =============================================================================

#[async_trait]
impl StorageStore for MemoryDatabase {
    async fn get_storage(&self, storage_id: &str) -> Result<Storage> {
        self.storages
            .read()
            .get(storage_id)
            .cloned()
            .ok_or_else(|| Error::StorageNotFound {
                storage_id: storage_id.to_string(),
            })
    }

    async fn list_storages(&self) -> Result<Vec<Storage>> {
        Ok(self.storages.read().values().cloned().collect())
    }

    async fn create_storage(&self, storage: Storage) -> Result<Storage> {
        let mut storages = self.storages.write();
        if storages.contains_key(&storage.id) {
            return Err(Error::AlreadyRegistered {
                reason: format!("storage {} already exists", storage.id),
            });
        }
        storages.insert(storage.id.clone(), storage.clone());
        Ok(storage)
    }

    async fn update_storage(&self, storage_id: &str, mut storage: Storage) -> Result<Storage> {
        let mut storages = self.storages.write();
        let slot = storages
            .get_mut(storage_id)
            .ok_or_else(|| Error::StorageNotFound {
                storage_id: storage_id.to_string(),
            })?;
        storage.id = storage_id.to_string();
        *slot = storage.clone();
        Ok(storage)
    }

    async fn delete_storage(&self, storage_id: &str) -> Result<()> {
        if self.failing_deletes.lock().contains(storage_id) {
            return Err(Error::Internal(format!("delete of storage {} failed", storage_id)));
        }
        self.storages.write().remove(storage_id);
        Ok(())
    }
}

// =============================================================================
// Centralized Manager
// =============================================================================

#[async_trait]
impl CentralizedManagerStore for MemoryDatabase {
    async fn get_centralized_manager(&self, id: &str) -> Result<CentralizedManager> {
        self.centralized_managers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::CentralizedManagerNotFound { id: id.to_string() })
    }

    async fn list_centralized_managers(&self) -> Result<Vec<CentralizedManager>> {
        Ok(self.centralized_managers.read().values().cloned().collect())
    }

    async fn find_centralized_manager_by_derived_id(
        &self,
        derived_id: &str,
    ) -> Result<Option<CentralizedManager>> {
        Ok(self
            .centralized_managers
            .read()
            .values()
            .find(|cm| cm.derived_id == derived_id)
            .cloned())
    }

    async fn create_centralized_manager(
        &self,
        cm: CentralizedManager,
    ) -> Result<CentralizedManager> {
        let mut cms = self.centralized_managers.write();
        if cms.contains_key(&cm.id) {
            return Err(Error::AlreadyRegistered {
                reason: format!("centralized manager {} already exists", cm.id),
            });
        }
        cms.insert(cm.id.clone(), cm.clone());
        Ok(cm)
    }

    async fn update_centralized_manager(
        &self,
        cm: CentralizedManager,
    ) -> Result<CentralizedManager> {
        let mut cms = self.centralized_managers.write();
        let slot = cms
            .get_mut(&cm.id)
            .ok_or_else(|| Error::CentralizedManagerNotFound { id: cm.id.clone() })?;
        *slot = cm.clone();
        Ok(cm)
    }

    async fn delete_centralized_manager(&self, id: &str) -> Result<()> {
        self.centralized_managers.write().remove(id);
        Ok(())
    }
}

// =============================================================================
// Sync State
// =============================================================================

#[async_trait]
impl SyncStateStore for MemoryDatabase {
    async fn try_begin_sync(
        &self,
        storage_id: &str,
        resource_count: u32,
        expiration: Duration,
    ) -> Result<SyncState> {
        let now = Utc::now();
        let mut states = self.sync_states.lock();
        let state = states.entry(storage_id.to_string()).or_default();

        if state.is_syncing {
            if !state.is_expired(expiration, now) {
                return Err(Error::SyncAlreadyInProgress {
                    storage_id: storage_id.to_string(),
                });
            }
            warn!(
                storage_id = %storage_id,
                "Previous sync expired with {} resource(s) outstanding",
                state.remaining_resource_count
            );
        }

        *state = SyncState {
            is_syncing: resource_count > 0,
            remaining_resource_count: resource_count,
            started_at: Some(now),
        };
        Ok(state.clone())
    }

    async fn complete_resource(&self, storage_id: &str) -> Result<SyncState> {
        let mut states = self.sync_states.lock();
        let state = states.entry(storage_id.to_string()).or_default();
        if !state.is_syncing {
            return Ok(state.clone());
        }

        state.remaining_resource_count = state.remaining_resource_count.saturating_sub(1);
        if state.remaining_resource_count == 0 {
            *state = SyncState::idle();
        }
        Ok(state.clone())
    }

    async fn get_sync_state(&self, storage_id: &str) -> Result<SyncState> {
        Ok(self
            .sync_states
            .lock()
            .get(storage_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear_sync_state(&self, storage_id: &str) -> Result<()> {
        self.sync_states.lock().remove(storage_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::test_access_info;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_access_info_crud_and_filter() {
        let db = MemoryDatabase::new();
        let mut info = test_access_info("10.0.0.5", 8443);
        info.storage_id = "st-1".into();
        info.driver_id = "st-1".into();
        db.create_access_info(info.clone()).await.unwrap();

        assert_matches!(
            db.create_access_info(info.clone()).await,
            Err(Error::AlreadyRegistered { .. })
        );

        let found = db
            .list_access_infos(&info.connection_filter())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let mut other = test_access_info("10.0.0.6", 8443);
        other.storage_id = "ignored".into();
        db.update_access_info("st-1", other).await.unwrap();
        assert!(db
            .list_access_infos(&info.connection_filter())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(db.get_access_info("st-1").await.unwrap().storage_id, "st-1");

        db.delete_access_info("st-1").await.unwrap();
        db.delete_access_info("st-1").await.unwrap();
        assert_matches!(
            db.get_access_info("st-1").await,
            Err(Error::AccessInfoNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_find_centralized_manager_by_derived_id() {
        let db = MemoryDatabase::new();
        db.create_centralized_manager(CentralizedManager {
            id: "cm-1".into(),
            derived_id: "abc".into(),
            vendor: "Dell EMC".into(),
            model: "VMAX".into(),
            storages: Vec::new(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        assert!(db
            .find_centralized_manager_by_derived_id("abc")
            .await
            .unwrap()
            .is_some());
        assert!(db
            .find_centralized_manager_by_derived_id("xyz")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_sync_gate_is_compare_and_set() {
        let db = MemoryDatabase::new();
        let expiration = Duration::from_secs(600);

        let state = db.try_begin_sync("st-1", 2, expiration).await.unwrap();
        assert!(state.is_syncing);
        assert_eq!(state.remaining_resource_count, 2);

        assert_matches!(
            db.try_begin_sync("st-1", 2, expiration).await,
            Err(Error::SyncAlreadyInProgress { .. })
        );

        assert!(db.complete_resource("st-1").await.unwrap().is_syncing);
        assert!(!db.complete_resource("st-1").await.unwrap().is_syncing);
        assert!(db.try_begin_sync("st-1", 2, expiration).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_sync_can_restart() {
        let db = MemoryDatabase::new();
        db.try_begin_sync("st-1", 3, Duration::from_secs(600))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let state = db
            .try_begin_sync("st-1", 3, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(state.remaining_resource_count, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_begin_admits_one() {
        let db = Arc::new(MemoryDatabase::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                db.try_begin_sync("st-1", 9, Duration::from_secs(600))
                    .await
                    .is_ok()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }
}
