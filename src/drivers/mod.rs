//! Storage Drivers
//!
//! Provides the plugin registry and the driver implementations:
//! - Fake: in-memory arrays for standalone use and tests
//! - VMAX: Dell EMC Unisphere REST
//!
//! The [`DriverManager`] caches one connected session per managing entity.

pub mod fake;
pub mod manager;
pub mod ssl;
pub mod vmax;

pub use fake::{FakeDriverConfig, FakeDriverPlugin, FakeStorageDriver};
pub use manager::{DriverLookup, DriverManager, DriverManagerConfig};
pub use ssl::{CaBundle, TlsOptions};
pub use vmax::VmaxDriverPlugin;

use crate::domain::models::AccessInfo;
use crate::domain::ports::StorageDriverRef;
use crate::error::{Error, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

/// Constructs connected driver sessions for one `(vendor, model)`
#[async_trait]
pub trait DriverPlugin: Send + Sync {
    /// Registry key, `"<vendor> <model>"`
    fn name(&self) -> String;

    /// Open a session against the endpoint described by `access`
    ///
    /// Passwords in `access` are already decrypted.
    async fn connect(&self, access: &AccessInfo, tls: &TlsOptions) -> Result<StorageDriverRef>;
}

pub type DriverPluginRef = Arc<dyn DriverPlugin>;

// =============================================================================
// Driver Registry
// =============================================================================

/// Statically known plugins keyed by `"<vendor> <model>"`
#[derive(Default)]
pub struct DriverRegistry {
    plugins: RwLock<IndexMap<String, DriverPluginRef>>,
}

impl DriverRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in plugin
    pub fn with_builtin() -> Result<Self> {
        let registry = Self::new();
        registry.register(Arc::new(FakeDriverPlugin::default()))?;
        registry.register(Arc::new(VmaxDriverPlugin::default()))?;
        Ok(registry)
    }

    /// Add a plugin; names are unique
    pub fn register(&self, plugin: DriverPluginRef) -> Result<()> {
        let name = plugin.name();
        let mut plugins = self.plugins.write();
        if plugins.contains_key(&name) {
            return Err(Error::DriverAlreadyRegistered { name });
        }
        info!("Registered storage driver: {}", name);
        plugins.insert(name, plugin);
        Ok(())
    }

    /// Look up the plugin for `(vendor, model)`
    pub fn resolve_driver_class(&self, vendor: &str, model: &str) -> Result<DriverPluginRef> {
        let name = format!("{} {}", vendor, model);
        self.plugins
            .read()
            .get(&name)
            .cloned()
            .ok_or(Error::DriverNotFound { name })
    }

    /// Registered plugin names, in registration order
    pub fn names(&self) -> Vec<String> {
        self.plugins.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}
