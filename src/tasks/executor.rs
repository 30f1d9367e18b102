//! Task Executor
//!
//! Local consumer of the task queue for standalone deployments. Each message
//! runs on its own tokio task so a slow array does not hold up the queue.

use crate::controlplane::sync::SyncOrchestrator;
use crate::domain::models::{AlertQuery, Capabilities};
use crate::domain::ports::DatabaseRef;
use crate::drivers::{DriverLookup, DriverManager};
use crate::error::{Error, Result};
use crate::tasks::catalogue::KindCatalogue;
use crate::tasks::dispatcher::TaskMessage;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs dispatched tasks against cached drivers
pub struct TaskExecutor {
    drivers: Arc<DriverManager>,
    db: DatabaseRef,
    catalogue: Arc<KindCatalogue>,
    sync: Arc<SyncOrchestrator>,
    /// Storages with performance monitoring enabled
    monitored: DashMap<String, Capabilities>,
}

impl TaskExecutor {
    pub fn new(
        drivers: Arc<DriverManager>,
        db: DatabaseRef,
        catalogue: Arc<KindCatalogue>,
        sync: Arc<SyncOrchestrator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            drivers,
            db,
            catalogue,
            sync,
            monitored: DashMap::new(),
        })
    }

    /// Consume `rx` until it closes or `shutdown` fires
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<TaskMessage>, shutdown: CancellationToken) {
        info!("Task executor started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    let executor = self.clone();
                    tokio::spawn(async move {
                        let task = message.task_type();
                        let storage_id = message.storage_id().to_string();
                        match executor.handle(message).await {
                            Ok(()) => {}
                            Err(e) if e.is_retryable() => {
                                warn!(storage_id = %storage_id, "Task {} failed, next run retries: {}", task, e);
                            }
                            Err(e) => {
                                error!(storage_id = %storage_id, "Task {} failed: {}", task, e);
                            }
                        }
                    });
                }
            }
        }
        info!("Task executor stopped");
    }

    /// Execute one message
    pub async fn handle(&self, message: TaskMessage) -> Result<()> {
        match message {
            TaskMessage::ResourceSync { storage_id, kind } => {
                let result = self.sync_resource(&storage_id, &kind).await;
                // The gate must close even when collection failed
                self.sync.on_resource_synced(&storage_id, &kind).await?;
                result
            }
            TaskMessage::AlertSync { storage_id } => {
                let driver = self
                    .drivers
                    .get_driver(DriverLookup::Storage(&storage_id), true)
                    .await?;
                let query = AlertQuery {
                    begin_time: None,
                    end_time: Some(Utc::now()),
                };
                let alerts = driver.list_alerts(&query).await?;
                info!(storage_id = %storage_id, "Synced {} alert(s)", alerts.len());
                Ok(())
            }
            TaskMessage::EnablePerformanceMonitoring {
                storage_id,
                capabilities,
            } => {
                info!(storage_id = %storage_id, "Performance monitoring enabled");
                self.monitored.insert(storage_id, capabilities);
                Ok(())
            }
            TaskMessage::TelemetryTeardown { storage_id, kind } => {
                if self.monitored.remove(&storage_id).is_some() {
                    info!(storage_id = %storage_id, kind = %kind, "Performance monitoring removed");
                }
                Ok(())
            }
            TaskMessage::ResourceTeardown { storage_id, kind } => {
                debug!(storage_id = %storage_id, kind = %kind, "Resource records removed");
                Ok(())
            }
        }
    }

    async fn sync_resource(&self, storage_id: &str, kind: &str) -> Result<()> {
        let resource = self
            .catalogue
            .resource_kind(kind)
            .ok_or_else(|| Error::Internal(format!("unknown resource kind {}", kind)))?;
        let storage = self.db.get_storage(storage_id).await?;
        let driver = self
            .drivers
            .get_driver(DriverLookup::Storage(storage_id), true)
            .await?;

        let count = (resource.collect)(driver.as_ref(), &storage.serial_number).await?;
        debug!(storage_id = %storage_id, kind = %kind, "Synced {} record(s)", count);
        Ok(())
    }

    /// Storages currently collecting performance metrics, sorted
    pub fn monitored_storages(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.monitored.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::sync::SyncConfig;
    use crate::db::MemoryDatabase;
    use crate::domain::cipher::Base64Cipher;
    use crate::domain::models::Storage;
    use crate::domain::ports::{AccessInfoStore, CredentialCipher, StorageStore, SyncStateStore};
    use crate::drivers::fake::{fake_access_info, FakeDriverPlugin};
    use crate::drivers::{DriverManagerConfig, DriverRegistry};
    use crate::metrics::test_metrics;
    use crate::tasks::dispatcher::ChannelDispatcher;
    use std::time::Duration;

    struct Fixture {
        db: Arc<MemoryDatabase>,
        sync: Arc<SyncOrchestrator>,
        executor: Arc<TaskExecutor>,
        rx: mpsc::Receiver<TaskMessage>,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(MemoryDatabase::new());
        let metrics = test_metrics();
        let registry = DriverRegistry::new();
        registry.register(Arc::new(FakeDriverPlugin::default())).unwrap();
        let drivers = DriverManager::new(
            DriverManagerConfig::default(),
            Arc::new(registry),
            db.clone(),
            Arc::new(Base64Cipher),
            metrics.clone(),
        );

        let mut access = fake_access_info("10.0.0.1", 8088)
            .map_passwords(|p| Base64Cipher.encrypt(p))
            .unwrap();
        access.storage_id = "s1".into();
        access.driver_id = "s1".into();
        db.create_access_info(access).await.unwrap();
        db.create_storage(Storage {
            id: "s1".into(),
            name: "array".into(),
            vendor: "fake_storage".into(),
            model: "fake_driver".into(),
            serial_number: "FAKE-10.0.0.1-8088-000".into(),
            ..Default::default()
        })
        .await
        .unwrap();

        let catalogue = Arc::new(KindCatalogue::with_defaults());
        let (dispatcher, rx) = ChannelDispatcher::new(64, metrics.clone());
        let sync = SyncOrchestrator::new(
            SyncConfig::default(),
            db.clone(),
            catalogue.clone(),
            Arc::new(dispatcher),
            metrics,
        );
        let executor = TaskExecutor::new(drivers, db.clone(), catalogue, sync.clone());
        Fixture {
            db,
            sync,
            executor,
            rx,
        }
    }

    #[tokio::test]
    async fn test_full_sync_closes_gate() {
        let f = fixture().await;
        let shutdown = CancellationToken::new();
        f.sync.start_sync("s1").await.unwrap();
        assert!(f.db.get_sync_state("s1").await.unwrap().is_syncing);

        let runner = tokio::spawn(f.executor.clone().run(f.rx, shutdown.clone()));

        let mut idle = false;
        for _ in 0..100 {
            if !f.db.get_sync_state("s1").await.unwrap().is_syncing {
                idle = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(idle);

        shutdown.cancel();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_collection_still_reports() {
        let f = fixture().await;
        f.db.delete_access_info("s1").await.unwrap();
        f.db.try_begin_sync("s1", 1, Duration::from_secs(60))
            .await
            .unwrap();

        let result = f
            .executor
            .handle(TaskMessage::ResourceSync {
                storage_id: "s1".into(),
                kind: "volumes".into(),
            })
            .await;
        assert!(result.is_err());
        assert!(!f.db.get_sync_state("s1").await.unwrap().is_syncing);
    }

    #[tokio::test]
    async fn test_monitoring_set_follows_messages() {
        let f = fixture().await;
        f.executor
            .handle(TaskMessage::EnablePerformanceMonitoring {
                storage_id: "s1".into(),
                capabilities: Capabilities::default(),
            })
            .await
            .unwrap();
        assert_eq!(f.executor.monitored_storages(), vec!["s1".to_string()]);

        f.executor
            .handle(TaskMessage::TelemetryTeardown {
                storage_id: "s1".into(),
                kind: "performance_collection".into(),
            })
            .await
            .unwrap();
        assert!(f.executor.monitored_storages().is_empty());
    }

    #[tokio::test]
    async fn test_alert_sync_uses_cached_driver() {
        let f = fixture().await;
        f.executor
            .handle(TaskMessage::AlertSync {
                storage_id: "s1".into(),
            })
            .await
            .unwrap();
        assert_eq!(f.executor.drivers.cached_driver_ids(), vec!["s1".to_string()]);
    }
}
