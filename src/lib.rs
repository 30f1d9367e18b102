//! Storage Array Manager
//!
//! Control plane for external storage arrays: registers arrays behind
//! single or centralized-manager endpoints, caches one driver session per
//! managing entity and keeps the resource inventory in sync through a
//! queue of background tasks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     REST API / Probe server                       │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────┐        ┌──────────────────────────┐  │
//! │  │ Discovery Orchestrator │───────▶│   Sync Orchestrator      │  │
//! │  │ (dedup, registration)  │        │ (per-kind sync state)    │  │
//! │  └───────────┬────────────┘        └────────────┬─────────────┘  │
//! │              │                                  │ TaskMessage    │
//! │  ┌───────────┴────────────┐        ┌────────────┴─────────────┐  │
//! │  │     Driver Manager     │◀───────│      Task Executor       │  │
//! │  │ (registry + instance   │        │  (resource collectors)   │  │
//! │  │  cache per driver_id)  │        └──────────────────────────┘  │
//! │  └───────────┬────────────┘                                      │
//! ├──────────────┼───────────────────────────────────────────────────┤
//! │   Drivers    │  Database          Distributed locks              │
//! │  (VMAX, fake)│  (in-memory)       (local / Kubernetes Lease)     │
//! └──────────────┴───────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Discovery and sync orchestrators and the APIs
//! - [`drivers`]: Driver plugins, registry and the instance cache
//! - [`tasks`]: Resource kind catalogue, task dispatch and execution
//! - [`coordination`]: Distributed locks
//! - [`db`]: Persistence
//! - [`domain`]: Core domain types and ports
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod coordination;
pub mod db;
pub mod domain;
pub mod drivers;
pub mod error;
pub mod metrics;
pub mod tasks;

// Re-export commonly used types
pub use config::ServiceConfig;

pub use controlplane::{
    ApiServer, ApiServerConfig, DiscoveryConfig, DiscoveryOrchestrator, SyncConfig,
    SyncOrchestrator, SyncSummary,
};

pub use coordination::{build_lock_manager, CoordinationConfig, LockBackend, LockGuard};

pub use db::MemoryDatabase;

pub use domain::cipher::Base64Cipher;
pub use domain::models::{
    AccessInfo, CentralizedManager, Protocol, ProtocolAccess, Storage, SyncState,
};
pub use domain::ports::{
    CredentialCipher, Database, DistributedLock, StorageDriver, TaskDispatcher,
};

pub use drivers::{DriverLookup, DriverManager, DriverManagerConfig, DriverPlugin, DriverRegistry};

pub use error::{Error, ErrorAction, Result};

pub use metrics::Metrics;

pub use tasks::{ChannelDispatcher, KindCatalogue, TaskConfig, TaskExecutor, TaskMessage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
