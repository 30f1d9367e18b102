//! Coordination
//!
//! Distributed lock backends:
//! - Local: in-process named locks
//! - Kubernetes: one Lease object per lock name
//!
//! [`with_lock`] scopes a critical section and releases the lock on every
//! exit path.

pub mod lease;
pub mod local;

pub use lease::LeaseLockManager;
pub use local::LocalLockManager;

use crate::domain::ports::{DistributedLockRef, LockHandle};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Which lock service backs [`crate::domain::ports::DistributedLock`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    #[default]
    Local,
    Kubernetes,
}

impl std::str::FromStr for LockBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(LockBackend::Local),
            "kubernetes" | "k8s" | "lease" => Ok(LockBackend::Kubernetes),
            other => Err(format!("unknown lock backend: {}", other)),
        }
    }
}

/// Configuration for the lock service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub backend: LockBackend,
    /// Namespace holding Lease objects
    pub namespace: String,
    /// Lease validity in seconds
    pub lease_duration_secs: u64,
    /// Identity of this replica; defaults to the pod hostname
    pub holder_identity: Option<String>,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::Local,
            namespace: "default".to_string(),
            lease_duration_secs: 60,
            holder_identity: None,
        }
    }
}

/// Build the configured lock service
pub async fn build_lock_manager(config: &CoordinationConfig) -> Result<DistributedLockRef> {
    match config.backend {
        LockBackend::Local => Ok(Arc::new(LocalLockManager::new())),
        LockBackend::Kubernetes => {
            let client = kube::Client::try_default().await?;
            let holder = config
                .holder_identity
                .clone()
                .or_else(|| std::env::var("HOSTNAME").ok())
                .unwrap_or_else(|| format!("storage-array-manager-{}", uuid::Uuid::new_v4()));
            info!(
                "Using Lease locks in namespace {} as {}",
                config.namespace, holder
            );
            Ok(Arc::new(LeaseLockManager::new(
                client,
                &config.namespace,
                holder,
                Duration::from_secs(config.lease_duration_secs),
            )))
        }
    }
}

/// A held lock
///
/// Dropping the guard without calling [`LockGuard::release`] schedules the
/// release on the current runtime. A critical section whose future is
/// cancelled therefore still gives the lock back.
pub struct LockGuard {
    locks: DistributedLockRef,
    handle: Option<LockHandle>,
}

impl LockGuard {
    /// Wait at most `timeout` for `name`
    pub async fn acquire(locks: &DistributedLockRef, name: &str, timeout: Duration) -> Result<Self> {
        let handle = locks.acquire(name, timeout).await?;
        Ok(Self {
            locks: locks.clone(),
            handle: Some(handle),
        })
    }

    /// Release now and report the outcome
    pub async fn release(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.locks.release(handle).await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(lock = %handle.name, "Lock dropped while held, releasing");
                let locks = self.locks.clone();
                runtime.spawn(async move {
                    let name = handle.name.clone();
                    if let Err(e) = locks.release(handle).await {
                        warn!(lock = %name, "Failed to release dropped lock: {}", e);
                    }
                });
            }
            Err(_) => {
                warn!(lock = %handle.name, "No runtime left to release dropped lock");
            }
        }
    }
}

/// Run `f` while holding `name`
///
/// The lock is released whether `f` succeeds, fails or is cancelled. A
/// failed release is logged and does not mask the result of `f`.
pub async fn with_lock<T, F, Fut>(
    locks: &DistributedLockRef,
    name: &str,
    timeout: Duration,
    f: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let guard = LockGuard::acquire(locks, name, timeout).await?;
    let result = f().await;
    if let Err(e) = guard.release().await {
        warn!(lock = %name, "Failed to release lock: {}", e);
    }
    result
}
