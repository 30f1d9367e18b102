//! Domain Ports - Core trait definitions for the storage array manager
//!
//! These traits define the boundaries between the orchestration logic and
//! external systems: vendor drivers, the record store, the distributed lock
//! service and the task dispatch channel. Adapters implement these traits to
//! provide concrete functionality.

use crate::domain::models::{
    AccessInfo, AccessInfoFilter, Alert, AlertQuery, Capabilities, CentralizedManager,
    Controller, Disk, Filesystem, MetricSample, Port, Qtree, Quota, ResourceMetrics, Share,
    Storage, StoragePool, SyncState, Volume,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Storage Driver Port
// =============================================================================

/// Capability interface every vendor driver implements
///
/// One instance is a live session against a management endpoint. Listing
/// calls take the array serial number so a single session can serve every
/// storage behind a centralized manager.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Identity and capacity of the storage behind this endpoint
    async fn get_storage(&self) -> Result<Storage>;

    /// All storages behind a centralized manager
    async fn get_storages(&self) -> Result<Vec<Storage>> {
        Ok(vec![self.get_storage().await?])
    }

    async fn list_storage_pools(&self, serial_number: &str) -> Result<Vec<StoragePool>>;

    async fn list_volumes(&self, serial_number: &str) -> Result<Vec<Volume>>;

    async fn list_controllers(&self, serial_number: &str) -> Result<Vec<Controller>>;

    async fn list_ports(&self, serial_number: &str) -> Result<Vec<Port>>;

    async fn list_disks(&self, serial_number: &str) -> Result<Vec<Disk>>;

    async fn list_filesystems(&self, serial_number: &str) -> Result<Vec<Filesystem>>;

    async fn list_qtrees(&self, serial_number: &str) -> Result<Vec<Qtree>>;

    async fn list_shares(&self, serial_number: &str) -> Result<Vec<Share>>;

    async fn list_quotas(&self, serial_number: &str) -> Result<Vec<Quota>>;

    /// Normalise a raw trap payload
    async fn parse_alert(&self, alert: &BTreeMap<String, String>) -> Result<Alert>;

    async fn clear_alert(&self, sequence_number: &str) -> Result<()>;

    async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>>;

    async fn collect_perf_metrics(
        &self,
        serial_number: &str,
        resource_metrics: &ResourceMetrics,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>>;

    /// Telemetry declaration; an empty one means "no telemetry"
    async fn get_capabilities(&self) -> Result<Capabilities>;
}

// =============================================================================
// Record Store Ports
// =============================================================================

/// Persistence of connection credentials
#[async_trait]
pub trait AccessInfoStore: Send + Sync {
    /// Fails with `AccessInfoNotFound` when absent
    async fn get_access_info(&self, storage_id: &str) -> Result<AccessInfo>;

    async fn list_access_infos(&self, filter: &AccessInfoFilter) -> Result<Vec<AccessInfo>>;

    async fn create_access_info(&self, info: AccessInfo) -> Result<AccessInfo>;

    async fn update_access_info(&self, storage_id: &str, info: AccessInfo) -> Result<AccessInfo>;

    /// Deleting a missing record is a no-op
    async fn delete_access_info(&self, storage_id: &str) -> Result<()>;
}

/// Persistence of storage records
#[async_trait]
pub trait StorageStore: Send + Sync {
    /// Fails with `StorageNotFound` when absent
    async fn get_storage(&self, storage_id: &str) -> Result<Storage>;

    async fn list_storages(&self) -> Result<Vec<Storage>>;

    async fn create_storage(&self, storage: Storage) -> Result<Storage>;

    async fn update_storage(&self, storage_id: &str, storage: Storage) -> Result<Storage>;

    async fn delete_storage(&self, storage_id: &str) -> Result<()>;
}

/// Persistence of centralized managers
#[async_trait]
pub trait CentralizedManagerStore: Send + Sync {
    /// Fails with `CentralizedManagerNotFound` when absent
    async fn get_centralized_manager(&self, id: &str) -> Result<CentralizedManager>;

    async fn list_centralized_managers(&self) -> Result<Vec<CentralizedManager>>;

    async fn find_centralized_manager_by_derived_id(
        &self,
        derived_id: &str,
    ) -> Result<Option<CentralizedManager>>;

    async fn create_centralized_manager(&self, cm: CentralizedManager)
        -> Result<CentralizedManager>;

    async fn update_centralized_manager(&self, cm: CentralizedManager)
        -> Result<CentralizedManager>;

    async fn delete_centralized_manager(&self, id: &str) -> Result<()>;
}

/// Compare-and-set storage of the per-storage sync gate
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    /// Atomically move a storage from idle to syncing
    ///
    /// Fails with `SyncAlreadyInProgress` unless the storage is idle or its
    /// running sync is older than `expiration`.
    async fn try_begin_sync(
        &self,
        storage_id: &str,
        resource_count: u32,
        expiration: Duration,
    ) -> Result<SyncState>;

    /// Record one finished resource kind, clearing the gate at zero
    async fn complete_resource(&self, storage_id: &str) -> Result<SyncState>;

    async fn get_sync_state(&self, storage_id: &str) -> Result<SyncState>;

    async fn clear_sync_state(&self, storage_id: &str) -> Result<()>;
}

/// Every store the orchestrators consume
pub trait Database:
    AccessInfoStore + StorageStore + CentralizedManagerStore + SyncStateStore
{
}

impl<T> Database for T where
    T: AccessInfoStore + StorageStore + CentralizedManagerStore + SyncStateStore
{
}

// =============================================================================
// Distributed Lock Port
// =============================================================================

/// Proof of a held lock, returned to `release`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub name: String,
    /// Identifies this holder
    pub token: String,
}

/// Named mutual exclusion shared by every replica of the service
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Wait at most `timeout`, then fail with `LockTimeout`
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockHandle>;

    async fn release(&self, handle: LockHandle) -> Result<()>;
}

// =============================================================================
// Task Dispatch Port
// =============================================================================

/// Fire-and-forget sends to the asynchronous task executor
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch_resource_sync(&self, storage_id: &str, kind: &str) -> Result<()>;

    async fn dispatch_resource_teardown(&self, storage_id: &str, kind: &str) -> Result<()>;

    async fn dispatch_telemetry_teardown(&self, storage_id: &str, kind: &str) -> Result<()>;

    async fn dispatch_alert_sync(&self, storage_id: &str) -> Result<()>;

    async fn enable_performance_monitoring(
        &self,
        storage_id: &str,
        capabilities: &Capabilities,
    ) -> Result<()>;
}

// =============================================================================
// Credential Cipher Port
// =============================================================================

/// Encryption of stored passwords
pub trait CredentialCipher: Send + Sync {
    fn encrypt(&self, plain: &str) -> Result<String>;

    fn decrypt(&self, encrypted: &str) -> Result<String>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type StorageDriverRef = Arc<dyn StorageDriver>;
pub type DatabaseRef = Arc<dyn Database>;
pub type DistributedLockRef = Arc<dyn DistributedLock>;
pub type TaskDispatcherRef = Arc<dyn TaskDispatcher>;
pub type CredentialCipherRef = Arc<dyn CredentialCipher>;
