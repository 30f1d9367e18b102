//! In-Process Lock Manager
//!
//! Named locks shared by every task in one process. Suitable for single
//! replica deployments and tests.

use crate::domain::ports::{DistributedLock, LockHandle};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Named locks with bounded waits
#[derive(Debug, Default)]
pub struct LocalLockManager {
    /// Lock name -> holder token
    held: Mutex<HashMap<String, String>>,
    released: Notify,
}

impl LocalLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `name` is currently held
    pub fn is_held(&self, name: &str) -> bool {
        self.held.lock().contains_key(name)
    }
}

#[async_trait]
impl DistributedLock for LocalLockManager {
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockHandle> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register for wakeups before checking, so a release in between
            // is not missed
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut held = self.held.lock();
                if !held.contains_key(name) {
                    let token = Uuid::new_v4().to_string();
                    held.insert(name.to_string(), token.clone());
                    debug!(lock = %name, "Acquired local lock");
                    return Ok(LockHandle {
                        name: name.to_string(),
                        token,
                    });
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::LockTimeout {
                    name: name.to_string(),
                    timeout,
                });
            }
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<()> {
        let mut held = self.held.lock();
        match held.get(&handle.name) {
            Some(token) if *token == handle.token => {
                held.remove(&handle.name);
                drop(held);
                self.released.notify_waiters();
                debug!(lock = %handle.name, "Released local lock");
                Ok(())
            }
            _ => Err(Error::LockNotHeld { name: handle.name }),
        }
    }
}
