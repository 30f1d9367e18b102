//! Task Dispatch
//!
//! Fire-and-forget delivery of [`TaskMessage`]s to the executor over a
//! bounded tokio channel. A send never waits: a full queue is reported as a
//! dispatch failure to the caller, which decides whether that is fatal.

use crate::domain::models::Capabilities;
use crate::domain::ports::TaskDispatcher;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

// =============================================================================
// Messages
// =============================================================================

/// Work item for the task executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskMessage {
    ResourceSync {
        storage_id: String,
        kind: String,
    },
    ResourceTeardown {
        storage_id: String,
        kind: String,
    },
    TelemetryTeardown {
        storage_id: String,
        kind: String,
    },
    AlertSync {
        storage_id: String,
    },
    EnablePerformanceMonitoring {
        storage_id: String,
        capabilities: Capabilities,
    },
}

impl TaskMessage {
    /// Label used in logs and metrics
    pub fn task_type(&self) -> &'static str {
        match self {
            TaskMessage::ResourceSync { .. } => "resource_sync",
            TaskMessage::ResourceTeardown { .. } => "resource_teardown",
            TaskMessage::TelemetryTeardown { .. } => "telemetry_teardown",
            TaskMessage::AlertSync { .. } => "alert_sync",
            TaskMessage::EnablePerformanceMonitoring { .. } => "enable_performance_monitoring",
        }
    }

    pub fn storage_id(&self) -> &str {
        match self {
            TaskMessage::ResourceSync { storage_id, .. }
            | TaskMessage::ResourceTeardown { storage_id, .. }
            | TaskMessage::TelemetryTeardown { storage_id, .. }
            | TaskMessage::AlertSync { storage_id }
            | TaskMessage::EnablePerformanceMonitoring { storage_id, .. } => storage_id,
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Task queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Messages buffered before dispatch fails
    pub queue_capacity: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

// =============================================================================
// Channel Dispatcher
// =============================================================================

/// [`TaskDispatcher`] backed by a bounded in-process queue
#[derive(Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<TaskMessage>,
    metrics: Arc<Metrics>,
}

impl ChannelDispatcher {
    /// Create the dispatcher and the receiving end for the executor
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> (Self, mpsc::Receiver<TaskMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, metrics }, rx)
    }

    fn send(&self, message: TaskMessage) -> Result<()> {
        let task = message.task_type();
        let storage_id = message.storage_id().to_string();
        self.tx.try_send(message).map_err(|e| {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "task queue is full",
                mpsc::error::TrySendError::Closed(_) => "task executor has stopped",
            };
            Error::DispatchFailed {
                task: task.to_string(),
                reason: format!("{} (storage {})", reason, storage_id),
            }
        })?;
        self.metrics.record_dispatch(task);
        debug!(storage_id = %storage_id, "Dispatched {} task", task);
        Ok(())
    }
}

#[async_trait]
impl TaskDispatcher for ChannelDispatcher {
    async fn dispatch_resource_sync(&self, storage_id: &str, kind: &str) -> Result<()> {
        self.send(TaskMessage::ResourceSync {
            storage_id: storage_id.to_string(),
            kind: kind.to_string(),
        })
    }

    async fn dispatch_resource_teardown(&self, storage_id: &str, kind: &str) -> Result<()> {
        self.send(TaskMessage::ResourceTeardown {
            storage_id: storage_id.to_string(),
            kind: kind.to_string(),
        })
    }

    async fn dispatch_telemetry_teardown(&self, storage_id: &str, kind: &str) -> Result<()> {
        self.send(TaskMessage::TelemetryTeardown {
            storage_id: storage_id.to_string(),
            kind: kind.to_string(),
        })
    }

    async fn dispatch_alert_sync(&self, storage_id: &str) -> Result<()> {
        self.send(TaskMessage::AlertSync {
            storage_id: storage_id.to_string(),
        })
    }

    async fn enable_performance_monitoring(
        &self,
        storage_id: &str,
        capabilities: &Capabilities,
    ) -> Result<()> {
        self.send(TaskMessage::EnablePerformanceMonitoring {
            storage_id: storage_id.to_string(),
            capabilities: capabilities.clone(),
        })
    }
}

// =============================================================================
// Test Support
// =============================================================================

/// Dispatcher that records messages and fails on request
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingDispatcher {
    sent: parking_lot::Mutex<Vec<TaskMessage>>,
    /// (task type, storage id) pairs to reject
    failing: parking_lot::Mutex<Vec<(String, String)>>,
    /// (task type, 1-based call number) pairs to reject
    failing_calls: parking_lot::Mutex<Vec<(String, usize)>>,
    calls: parking_lot::Mutex<std::collections::HashMap<String, usize>>,
}

#[cfg(test)]
impl RecordingDispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_on(&self, task: &str, storage_id: &str) {
        self.failing
            .lock()
            .push((task.to_string(), storage_id.to_string()));
    }

    pub(crate) fn fail_nth(&self, task: &str, nth: usize) {
        self.failing_calls.lock().push((task.to_string(), nth));
    }

    pub(crate) fn sent(&self) -> Vec<TaskMessage> {
        self.sent.lock().clone()
    }

    pub(crate) fn sent_of(&self, task: &str) -> Vec<TaskMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.task_type() == task)
            .cloned()
            .collect()
    }

    fn record(&self, message: TaskMessage) -> Result<()> {
        let call = {
            let mut calls = self.calls.lock();
            let count = calls.entry(message.task_type().to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let rejected = self
            .failing
            .lock()
            .iter()
            .any(|(task, id)| task == message.task_type() && id == message.storage_id())
            || self
                .failing_calls
                .lock()
                .iter()
                .any(|(task, nth)| task == message.task_type() && *nth == call);
        if rejected {
            return Err(Error::DispatchFailed {
                task: message.task_type().to_string(),
                reason: "injected failure".into(),
            });
        }
        self.sent.lock().push(message);
        Ok(())
    }
}

#[cfg(test)]
#[async_trait]
impl TaskDispatcher for RecordingDispatcher {
    async fn dispatch_resource_sync(&self, storage_id: &str, kind: &str) -> Result<()> {
        self.record(TaskMessage::ResourceSync {
            storage_id: storage_id.into(),
            kind: kind.into(),
        })
    }

    async fn dispatch_resource_teardown(&self, storage_id: &str, kind: &str) -> Result<()> {
        self.record(TaskMessage::ResourceTeardown {
            storage_id: storage_id.into(),
            kind: kind.into(),
        })
    }

    async fn dispatch_telemetry_teardown(&self, storage_id: &str, kind: &str) -> Result<()> {
        self.record(TaskMessage::TelemetryTeardown {
            storage_id: storage_id.into(),
            kind: kind.into(),
        })
    }

    async fn dispatch_alert_sync(&self, storage_id: &str) -> Result<()> {
        self.record(TaskMessage::AlertSync {
            storage_id: storage_id.into(),
        })
    }

    async fn enable_performance_monitoring(
        &self,
        storage_id: &str,
        capabilities: &Capabilities,
    ) -> Result<()> {
        self.record(TaskMessage::EnablePerformanceMonitoring {
            storage_id: storage_id.into(),
            capabilities: capabilities.clone(),
        })
    }
}
