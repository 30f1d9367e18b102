//! Error types for the Storage Array Manager
//!
//! Provides structured error types for driver resolution, discovery,
//! synchronization, coordination and the persistence seams.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the manager
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    // =========================================================================
    // Driver Errors
    // =========================================================================
    #[error("Storage driver '{name}' could not be found")]
    DriverNotFound { name: String },

    #[error("Storage driver '{name}' is already registered")]
    DriverAlreadyRegistered { name: String },

    #[error("Driver transport error: {0}")]
    DriverTransport(#[from] reqwest::Error),

    #[error("Driver operation failed: {driver} - {operation}: {reason}")]
    DriverOperation {
        driver: String,
        operation: String,
        reason: String,
    },

    #[error("Operation {operation} is not supported by driver {driver}")]
    Unsupported { driver: String, operation: String },

    #[error("Certificate error for {path}: {reason}")]
    Certificate { path: String, reason: String },

    // =========================================================================
    // Registration Errors
    // =========================================================================
    #[error("Storage already registered: {reason}")]
    AlreadyRegistered { reason: String },

    #[error("Storage {storage_id} is inconsistent with the probed device: {reason}")]
    StorageInconsistent { storage_id: String, reason: String },

    #[error("Invalid access information: {0}")]
    InvalidAccessInfo(String),

    #[error("Resource metrics provided by capabilities are empty for storage {storage_id}")]
    EmptyResourceMetrics { storage_id: String },

    #[error("Invalid capabilities: {0}")]
    InvalidCapabilities(String),

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("Storage not found: {storage_id}")]
    StorageNotFound { storage_id: String },

    #[error("Access information not found for storage: {storage_id}")]
    AccessInfoNotFound { storage_id: String },

    #[error("Centralized manager not found: {id}")]
    CentralizedManagerNotFound { id: String },

    // =========================================================================
    // Coordination Errors
    // =========================================================================
    #[error("Timed out after {timeout:?} acquiring lock {name}")]
    LockTimeout { name: String, timeout: Duration },

    #[error("Lock {name} is not held by this process")]
    LockNotHeld { name: String },

    // =========================================================================
    // Sync Errors
    // =========================================================================
    #[error("Sync already in progress for storage {storage_id}")]
    SyncAlreadyInProgress { storage_id: String },

    #[error("Kind already registered: {kind}")]
    KindAlreadyRegistered { kind: String },

    #[error("Failed to dispatch {task}: {reason}")]
    DispatchFailed { task: String, reason: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action a caller should take when an operation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RequeueWithBackoff,
    /// Retry after specific duration
    RequeueAfter(Duration),
    /// Don't retry, the request itself must change
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::DriverTransport(_)
            | Error::LockTimeout { .. }
            | Error::DispatchFailed { .. } => ErrorAction::RequeueWithBackoff,

            // A running sync finishes on its own
            Error::SyncAlreadyInProgress { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(30))
            }

            // Conflicts, lookups and validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::DriverNotFound { .. }
            | Error::DriverAlreadyRegistered { .. }
            | Error::AlreadyRegistered { .. }
            | Error::StorageInconsistent { .. }
            | Error::InvalidAccessInfo(_)
            | Error::InvalidCapabilities(_)
            | Error::EmptyResourceMetrics { .. }
            | Error::Unsupported { .. }
            | Error::Certificate { .. }
            | Error::KindAlreadyRegistered { .. }
            | Error::StorageNotFound { .. }
            | Error::AccessInfoNotFound { .. }
            | Error::CentralizedManagerNotFound { .. }
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_)
                | Error::DriverTransport(_)
                | Error::LockTimeout { .. }
                | Error::DispatchFailed { .. }
        )
    }

    /// Check if this error reports a missing record
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::StorageNotFound { .. }
                | Error::AccessInfoNotFound { .. }
                | Error::CentralizedManagerNotFound { .. }
        )
    }
}

/// Result type alias for the manager
pub type Result<T> = std::result::Result<T, Error>;
