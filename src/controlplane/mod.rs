//! Control Plane Module
//!
//! Orchestration of storage array connections: registration and removal
//! (discovery), inventory synchronization (sync), and the API surface.

pub mod api;
pub mod discovery;
pub mod sync;

pub use api::*;
pub use discovery::{DiscoveryConfig, DiscoveryOrchestrator};
pub use sync::{SyncConfig, SyncOrchestrator, SyncSummary};
