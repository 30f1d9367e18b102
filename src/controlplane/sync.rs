//! Sync Orchestrator
//!
//! Fans out inventory synchronization for registered storages:
//! - `start_sync` opens the per-storage gate and dispatches one task per
//!   resource kind
//! - `on_resource_synced` closes the gate once every kind reported back
//! - `teardown` dispatches removal tasks for every resource and telemetry kind
//!
//! The orchestrator only enqueues work. Execution belongs to the task
//! executor behind the [`TaskDispatcher`].

use crate::domain::models::SyncState;
use crate::domain::ports::{DatabaseRef, TaskDispatcherRef};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::tasks::KindCatalogue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the sync orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// A running sync older than this may be restarted
    pub expiration_secs: u64,
    /// Interval of the periodic `sync_all` loop
    pub periodic_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            expiration_secs: 1800,
            periodic_interval_secs: 3600,
        }
    }
}

impl SyncConfig {
    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.expiration_secs)
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs.max(1))
    }
}

/// Outcome of one `sync_all` pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    /// Storages whose sync was started
    pub started: Vec<String>,
    /// Storages skipped because a sync was already running
    pub skipped: Vec<String>,
    /// Storages whose sync could not start for another reason
    pub failed: Vec<String>,
}

// =============================================================================
// Sync Orchestrator
// =============================================================================

/// Starts and tears down per-storage synchronization
pub struct SyncOrchestrator {
    config: SyncConfig,
    db: DatabaseRef,
    catalogue: Arc<KindCatalogue>,
    dispatcher: TaskDispatcherRef,
    metrics: Arc<Metrics>,
}

impl SyncOrchestrator {
    /// Create a new sync orchestrator
    pub fn new(
        config: SyncConfig,
        db: DatabaseRef,
        catalogue: Arc<KindCatalogue>,
        dispatcher: TaskDispatcherRef,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            db,
            catalogue,
            dispatcher,
            metrics,
        })
    }

    pub fn catalogue(&self) -> &Arc<KindCatalogue> {
        &self.catalogue
    }

    /// Start a sync for every registered storage
    ///
    /// A storage that cannot start is recorded in the summary; the batch
    /// always runs to the end.
    pub async fn sync_all(&self) -> Result<SyncSummary> {
        let storages = self.db.list_storages().await?;
        let mut summary = SyncSummary::default();

        for storage in storages {
            match self.start_sync(&storage.id).await {
                Ok(()) => summary.started.push(storage.id),
                Err(e @ Error::SyncAlreadyInProgress { .. }) => {
                    warn!(storage_id = %storage.id, "Skipping storage: {}", e);
                    summary.skipped.push(storage.id);
                }
                Err(e) => {
                    error!(storage_id = %storage.id, "Failed to start sync: {}", e);
                    summary.failed.push(storage.id);
                }
            }
        }

        info!(
            "Sync pass finished: {} started, {} skipped, {} failed",
            summary.started.len(),
            summary.skipped.len(),
            summary.failed.len()
        );
        Ok(summary)
    }

    /// Open the sync gate for one storage and dispatch every resource kind
    pub async fn start_sync(&self, storage_id: &str) -> Result<()> {
        // Unknown storages must not leave a gate behind
        self.db.get_storage(storage_id).await?;

        let kinds = self.catalogue.resource_kind_names();
        let count = u32::try_from(kinds.len())
            .map_err(|_| Error::Internal("too many resource kinds".into()))?;

        if let Err(e) = self
            .db
            .try_begin_sync(storage_id, count, self.config.expiration())
            .await
        {
            let outcome = match e {
                Error::SyncAlreadyInProgress { .. } => "skipped",
                _ => "failed",
            };
            self.metrics.sync_runs.with_label_values(&[outcome]).inc();
            return Err(e);
        }
        self.metrics.sync_runs.with_label_values(&["started"]).inc();
        info!(storage_id = %storage_id, "Starting sync of {} resource kind(s)", count);

        for kind in &kinds {
            if let Err(e) = self.dispatcher.dispatch_resource_sync(storage_id, kind).await {
                error!(
                    storage_id = %storage_id,
                    kind = %kind,
                    "Failed to dispatch resource sync: {}", e
                );
                self.metrics.record_step_failure("resource_sync");
                // Count the kind as done so the gate can still close
                self.db.complete_resource(storage_id).await?;
            }
        }
        Ok(())
    }

    /// Record completion of one resource kind
    pub async fn on_resource_synced(&self, storage_id: &str, kind: &str) -> Result<SyncState> {
        let state = self.db.complete_resource(storage_id).await?;
        debug!(
            storage_id = %storage_id,
            kind = %kind,
            "Resource synced, {} remaining", state.remaining_resource_count
        );
        if !state.is_syncing {
            info!(storage_id = %storage_id, "Sync finished");
        }
        Ok(state)
    }

    /// Dispatch teardown of every resource and telemetry kind for a storage
    ///
    /// Every kind is attempted; failures are aggregated into one
    /// `DispatchFailed`.
    pub async fn teardown(&self, storage_id: &str) -> Result<()> {
        let mut failures = Vec::new();

        for kind in self.catalogue.resource_kind_names() {
            if let Err(e) = self
                .dispatcher
                .dispatch_resource_teardown(storage_id, &kind)
                .await
            {
                failures.push(format!("{}: {}", kind, e));
            }
        }
        for kind in self.catalogue.telemetry_kind_names() {
            if let Err(e) = self
                .dispatcher
                .dispatch_telemetry_teardown(storage_id, &kind)
                .await
            {
                failures.push(format!("{}: {}", kind, e));
            }
        }

        if failures.is_empty() {
            debug!(storage_id = %storage_id, "Dispatched teardown tasks");
            Ok(())
        } else {
            Err(Error::DispatchFailed {
                task: "teardown".into(),
                reason: failures.join("; "),
            })
        }
    }

    /// Run `sync_all` every periodic interval until cancelled
    pub async fn run_periodic(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.periodic_interval();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        info!("Periodic sync every {:?}", period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Periodic sync stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_all().await {
                        error!("Periodic sync failed: {}", e);
                    }
                }
            }
        }
    }
}
