//! Kind Catalogue
//!
//! Append-only registry of resource kinds and telemetry kinds. The sync
//! orchestrator fans out over whatever is registered here, so adding a kind
//! is a registration, not a code change in the orchestrator.

use crate::domain::ports::StorageDriver;
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::debug;

/// Future returned by a collector, resolving to the number of records
pub type CollectFuture<'a> = BoxFuture<'a, Result<usize>>;

/// Pulls one kind of inventory for a storage through its driver
pub type Collector = for<'a> fn(&'a dyn StorageDriver, &'a str) -> CollectFuture<'a>;

// =============================================================================
// Kinds
// =============================================================================

/// One category of array inventory
#[derive(Clone)]
pub struct ResourceKind {
    pub name: String,
    pub description: String,
    /// Called with the driver and the storage serial number
    pub collect: Collector,
}

impl ResourceKind {
    pub fn new(name: impl Into<String>, description: impl Into<String>, collect: Collector) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            collect,
        }
    }
}

impl std::fmt::Debug for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceKind")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

/// One category of performance collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryKind {
    pub name: String,
    pub description: String,
}

impl TelemetryKind {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

// =============================================================================
// Collectors
// =============================================================================

macro_rules! collector {
    ($name:ident, $method:ident) => {
        fn $name<'a>(driver: &'a dyn StorageDriver, serial_number: &'a str) -> CollectFuture<'a> {
            Box::pin(async move { Ok(driver.$method(serial_number).await?.len()) })
        }
    };
}

collector!(collect_storage_pools, list_storage_pools);
collector!(collect_volumes, list_volumes);
collector!(collect_controllers, list_controllers);
collector!(collect_ports, list_ports);
collector!(collect_disks, list_disks);
collector!(collect_filesystems, list_filesystems);
collector!(collect_qtrees, list_qtrees);
collector!(collect_shares, list_shares);
collector!(collect_quotas, list_quotas);

// =============================================================================
// Catalogue
// =============================================================================

/// Registered kinds, in registration order
#[derive(Debug, Default)]
pub struct KindCatalogue {
    resources: RwLock<IndexMap<String, ResourceKind>>,
    telemetry: RwLock<IndexMap<String, TelemetryKind>>,
}

impl KindCatalogue {
    /// Create an empty catalogue
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalogue with the built-in inventory and telemetry kinds
    pub fn with_defaults() -> Self {
        let defaults: [(&str, &str, Collector); 9] = [
            ("storage_pools", "Storage pools", collect_storage_pools),
            ("volumes", "Volumes", collect_volumes),
            ("controllers", "Controllers", collect_controllers),
            ("ports", "Ports", collect_ports),
            ("disks", "Disks", collect_disks),
            ("filesystems", "Filesystems", collect_filesystems),
            ("qtrees", "Qtrees", collect_qtrees),
            ("shares", "Shares", collect_shares),
            ("quotas", "Quotas", collect_quotas),
        ];

        let catalogue = Self::new();
        {
            let mut resources = catalogue.resources.write();
            for (name, description, collect) in defaults {
                resources.insert(name.to_string(), ResourceKind::new(name, description, collect));
            }
        }
        catalogue.telemetry.write().insert(
            "performance_collection".to_string(),
            TelemetryKind::new("performance_collection", "Array performance metrics"),
        );
        catalogue
    }

    /// Append a resource kind; names are unique
    pub fn register_resource(&self, kind: ResourceKind) -> Result<()> {
        let mut resources = self.resources.write();
        if resources.contains_key(&kind.name) {
            return Err(Error::KindAlreadyRegistered { kind: kind.name });
        }
        debug!("Registered resource kind {}", kind.name);
        resources.insert(kind.name.clone(), kind);
        Ok(())
    }

    /// Append a telemetry kind; names are unique
    pub fn register_telemetry(&self, kind: TelemetryKind) -> Result<()> {
        let mut telemetry = self.telemetry.write();
        if telemetry.contains_key(&kind.name) {
            return Err(Error::KindAlreadyRegistered { kind: kind.name });
        }
        debug!("Registered telemetry kind {}", kind.name);
        telemetry.insert(kind.name.clone(), kind);
        Ok(())
    }

    pub fn resource_kind(&self, name: &str) -> Option<ResourceKind> {
        self.resources.read().get(name).cloned()
    }

    pub fn resource_kind_names(&self) -> Vec<String> {
        self.resources.read().keys().cloned().collect()
    }

    pub fn telemetry_kind_names(&self) -> Vec<String> {
        self.telemetry.read().keys().cloned().collect()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::fake::{fake_access_info, FakeDriverPlugin};
    use crate::drivers::ssl::TlsOptions;
    use crate::drivers::DriverPlugin;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_kinds_in_order() {
        let catalogue = KindCatalogue::with_defaults();
        assert_eq!(
            catalogue.resource_kind_names(),
            vec![
                "storage_pools",
                "volumes",
                "controllers",
                "ports",
                "disks",
                "filesystems",
                "qtrees",
                "shares",
                "quotas"
            ]
        );
        assert_eq!(
            catalogue.telemetry_kind_names(),
            vec!["performance_collection"]
        );
    }

    #[test]
    fn test_registration_is_append_only() {
        let catalogue = KindCatalogue::with_defaults();
        catalogue
            .register_resource(ResourceKind::new("snapshots", "Snapshots", collect_volumes))
            .unwrap();
        assert_eq!(catalogue.resource_count(), 10);
        assert_eq!(
            catalogue.resource_kind_names().last().map(String::as_str),
            Some("snapshots")
        );

        assert_matches!(
            catalogue.register_resource(ResourceKind::new("volumes", "dup", collect_volumes)),
            Err(Error::KindAlreadyRegistered { .. })
        );
        assert_matches!(
            catalogue.register_telemetry(TelemetryKind::new("performance_collection", "dup")),
            Err(Error::KindAlreadyRegistered { .. })
        );
    }

    #[tokio::test]
    async fn test_collector_counts_records() {
        let driver = FakeDriverPlugin::default()
            .connect(&fake_access_info("10.0.0.1", 8088), &TlsOptions::default())
            .await
            .unwrap();
        let kind = KindCatalogue::with_defaults().resource_kind("volumes").unwrap();

        let count = (kind.collect)(driver.as_ref(), "SN1").await.unwrap();
        assert_eq!(count, 4);
    }
}
