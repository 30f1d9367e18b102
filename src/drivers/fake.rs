//! Fake Storage Driver
//!
//! In-memory driver reporting deterministic inventory. Used by standalone
//! deployments for smoke testing and by every orchestration test. Failure
//! injection and a construction counter are exposed on the plugin.

use crate::domain::models::{
    AccessInfo, Alert, AlertQuery, AlertSeverity, Capabilities, Controller, Disk, Filesystem,
    MetricSample, MetricSpec, Port, Qtree, Quota, ResourceMetrics, ResourceStatus, Share,
    Storage, StoragePool, StorageStatus, Volume,
};
use crate::domain::ports::{StorageDriver, StorageDriverRef};
use crate::drivers::ssl::TlsOptions;
use crate::drivers::DriverPlugin;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const FAKE_VENDOR: &str = "fake_storage";
pub const FAKE_MODEL: &str = "fake_driver";

const GIB: u64 = 1024 * 1024 * 1024;

// =============================================================================
// Configuration
// =============================================================================

/// Behaviour of the fake driver
#[derive(Debug, Clone)]
pub struct FakeDriverConfig {
    /// Storages reported behind one endpoint
    pub storage_count: usize,
    /// Simulated session setup time
    pub connect_delay: Duration,
    /// Advertise performance metrics in capabilities
    pub with_metrics: bool,
    /// Serial prefix shared by every endpoint, instead of one per host
    pub serial_prefix: Option<String>,
}

impl Default for FakeDriverConfig {
    fn default() -> Self {
        Self {
            storage_count: 1,
            connect_delay: Duration::ZERO,
            with_metrics: true,
            serial_prefix: None,
        }
    }
}

// =============================================================================
// Plugin
// =============================================================================

/// Plugin constructing [`FakeStorageDriver`] sessions
#[derive(Debug, Default)]
pub struct FakeDriverPlugin {
    config: FakeDriverConfig,
    constructions: AtomicUsize,
    connecting: AtomicUsize,
    peak_connecting: AtomicUsize,
    fail_connect: AtomicBool,
}

impl FakeDriverPlugin {
    pub fn new(config: FakeDriverConfig) -> Self {
        Self {
            config,
            constructions: AtomicUsize::new(0),
            connecting: AtomicUsize::new(0),
            peak_connecting: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
        }
    }

    /// Number of sessions constructed so far
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    /// Highest number of connects that were in flight at once
    pub fn peak_concurrent_connects(&self) -> usize {
        self.peak_connecting.load(Ordering::SeqCst)
    }

    /// Make subsequent connects fail until cleared
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DriverPlugin for FakeDriverPlugin {
    fn name(&self) -> String {
        format!("{} {}", FAKE_VENDOR, FAKE_MODEL)
    }

    async fn connect(&self, access: &AccessInfo, _tls: &TlsOptions) -> Result<StorageDriverRef> {
        self.constructions.fetch_add(1, Ordering::SeqCst);
        let connecting = self.connecting.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_connecting.fetch_max(connecting, Ordering::SeqCst);
        if !self.config.connect_delay.is_zero() {
            tokio::time::sleep(self.config.connect_delay).await;
        }
        self.connecting.fetch_sub(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::DriverOperation {
                driver: self.name(),
                operation: "connect".into(),
                reason: "injected connection failure".into(),
            });
        }

        let endpoint = access.protocols().next().map(|(_, a)| a.endpoint()).ok_or_else(|| {
            Error::InvalidAccessInfo("no access protocol configured".into())
        })?;
        let serial_prefix = self
            .config
            .serial_prefix
            .clone()
            .unwrap_or_else(|| format!("FAKE-{}-{}", endpoint.host, endpoint.port));

        debug!("Fake driver connected to {}:{}", endpoint.host, endpoint.port);

        Ok(Arc::new(FakeStorageDriver {
            serial_prefix,
            storage_count: self.config.storage_count.max(1),
            with_metrics: self.config.with_metrics,
        }))
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Driver session reporting generated inventory
#[derive(Debug, Clone)]
pub struct FakeStorageDriver {
    serial_prefix: String,
    storage_count: usize,
    with_metrics: bool,
}

impl FakeStorageDriver {
    fn storage(&self, index: usize) -> Storage {
        let total = 100 * GIB;
        let used = 40 * GIB;
        Storage {
            id: String::new(),
            name: format!("fake-array-{}", index),
            vendor: FAKE_VENDOR.into(),
            model: FAKE_MODEL.into(),
            serial_number: format!("{}-{:03}", self.serial_prefix, index),
            firmware_version: "1.0.0".into(),
            status: StorageStatus::Normal,
            location: "lab".into(),
            description: "Fake storage array".into(),
            total_capacity: total,
            used_capacity: used,
            free_capacity: total - used,
            raw_capacity: 2 * total,
            subscribed_capacity: total,
        }
    }
}

#[async_trait]
impl StorageDriver for FakeStorageDriver {
    async fn get_storage(&self) -> Result<Storage> {
        Ok(self.storage(0))
    }

    async fn get_storages(&self) -> Result<Vec<Storage>> {
        Ok((0..self.storage_count).map(|i| self.storage(i)).collect())
    }

    async fn list_storage_pools(&self, serial_number: &str) -> Result<Vec<StoragePool>> {
        Ok((0..2)
            .map(|i| StoragePool {
                native_id: format!("{}-pool-{}", serial_number, i),
                name: format!("pool-{}", i),
                status: ResourceStatus::Normal,
                total_capacity: 50 * GIB,
                used_capacity: 20 * GIB,
                free_capacity: 30 * GIB,
            })
            .collect())
    }

    async fn list_volumes(&self, serial_number: &str) -> Result<Vec<Volume>> {
        Ok((0..4)
            .map(|i| Volume {
                native_id: format!("{}-vol-{}", serial_number, i),
                name: format!("volume-{}", i),
                status: ResourceStatus::Normal,
                native_pool_id: Some(format!("{}-pool-{}", serial_number, i % 2)),
                wwn: Some(format!("60000970000{:04}", i)),
                total_capacity: 10 * GIB,
                used_capacity: GIB,
            })
            .collect())
    }

    async fn list_controllers(&self, serial_number: &str) -> Result<Vec<Controller>> {
        Ok((0..2)
            .map(|i| Controller {
                native_id: format!("{}-ctrl-{}", serial_number, i),
                name: format!("controller-{}", i),
                status: ResourceStatus::Normal,
                soft_version: Some("1.0.0".into()),
                cpu_count: Some(8),
            })
            .collect())
    }

    async fn list_ports(&self, serial_number: &str) -> Result<Vec<Port>> {
        Ok((0..4)
            .map(|i| Port {
                native_id: format!("{}-port-{}", serial_number, i),
                name: format!("port-{}", i),
                native_controller_id: Some(format!("{}-ctrl-{}", serial_number, i % 2)),
                status: ResourceStatus::Normal,
                port_type: "fc".into(),
                speed_gbps: Some(16),
                ip_addresses: Vec::new(),
            })
            .collect())
    }

    async fn list_disks(&self, serial_number: &str) -> Result<Vec<Disk>> {
        Ok((0..6)
            .map(|i| Disk {
                native_id: format!("{}-disk-{}", serial_number, i),
                name: format!("disk-{}", i),
                serial_number: format!("{}-D{:02}", serial_number, i),
                status: ResourceStatus::Normal,
                physical_type: "ssd".into(),
                capacity: 20 * GIB,
            })
            .collect())
    }

    async fn list_filesystems(&self, serial_number: &str) -> Result<Vec<Filesystem>> {
        Ok(vec![Filesystem {
            native_id: format!("{}-fs-0", serial_number),
            name: "fs-0".into(),
            native_pool_id: Some(format!("{}-pool-0", serial_number)),
            status: ResourceStatus::Normal,
            total_capacity: 10 * GIB,
            used_capacity: 2 * GIB,
        }])
    }

    async fn list_qtrees(&self, serial_number: &str) -> Result<Vec<Qtree>> {
        Ok(vec![Qtree {
            native_id: format!("{}-qtree-0", serial_number),
            name: "qtree-0".into(),
            native_filesystem_id: format!("{}-fs-0", serial_number),
            path: "/fs-0/qtree-0".into(),
        }])
    }

    async fn list_shares(&self, serial_number: &str) -> Result<Vec<Share>> {
        Ok(vec![Share {
            native_id: format!("{}-share-0", serial_number),
            name: "share-0".into(),
            native_filesystem_id: format!("{}-fs-0", serial_number),
            protocol: "nfs".into(),
            path: "/fs-0".into(),
        }])
    }

    async fn list_quotas(&self, serial_number: &str) -> Result<Vec<Quota>> {
        Ok(vec![Quota {
            native_id: format!("{}-quota-0", serial_number),
            quota_type: "tree".into(),
            native_filesystem_id: format!("{}-fs-0", serial_number),
            capacity_hard_limit: Some(GIB),
            file_hard_limit: None,
        }])
    }

    async fn parse_alert(&self, alert: &BTreeMap<String, String>) -> Result<Alert> {
        let field = |key: &str| {
            alert.get(key).cloned().ok_or_else(|| Error::DriverOperation {
                driver: format!("{} {}", FAKE_VENDOR, FAKE_MODEL),
                operation: "parse_alert".into(),
                reason: format!("missing field {}", key),
            })
        };

        Ok(Alert {
            alert_id: field("alert_id")?,
            alert_name: field("alert_name")?,
            severity: AlertSeverity::Major,
            category: "fault".into(),
            description: alert.get("description").cloned().unwrap_or_default(),
            sequence_number: field("sequence_number")?,
            resource_type: "storage".into(),
            occur_time: Utc::now(),
        })
    }

    async fn clear_alert(&self, _sequence_number: &str) -> Result<()> {
        Ok(())
    }

    async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>> {
        let occur_time = query.begin_time.unwrap_or_else(Utc::now);
        Ok(vec![Alert {
            alert_id: "fake-alert-1".into(),
            alert_name: "Fake alert".into(),
            severity: AlertSeverity::Warning,
            category: "fault".into(),
            description: "Generated by the fake driver".into(),
            sequence_number: "1".into(),
            resource_type: "storage".into(),
            occur_time,
        }])
    }

    async fn collect_perf_metrics(
        &self,
        serial_number: &str,
        resource_metrics: &ResourceMetrics,
        _start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>> {
        let mut samples = Vec::new();
        for (resource_type, metrics) in resource_metrics {
            for (index, (metric, spec)) in metrics.iter().enumerate() {
                samples.push(MetricSample {
                    resource_type: resource_type.clone(),
                    resource_id: serial_number.to_string(),
                    metric: metric.clone(),
                    unit: spec.unit.clone(),
                    timestamp: end_time,
                    value: (index + 1) as f64 * 10.0,
                });
            }
        }
        Ok(samples)
    }

    async fn get_capabilities(&self) -> Result<Capabilities> {
        let mut resource_metrics = ResourceMetrics::new();
        if self.with_metrics {
            let mut storage = BTreeMap::new();
            storage.insert(
                "throughput".to_string(),
                MetricSpec {
                    unit: "MB/s".into(),
                    description: "Represents how much data is successfully transferred in MB/s"
                        .into(),
                },
            );
            storage.insert(
                "iops".to_string(),
                MetricSpec {
                    unit: "IOPS".into(),
                    description: "Input/output operations per second".into(),
                },
            );
            resource_metrics.insert("storage".to_string(), storage);
        }
        Ok(Capabilities {
            is_historic: true,
            resource_metrics,
        })
    }
}

#[cfg(test)]
pub(crate) fn fake_access_info(host: &str, port: u16) -> AccessInfo {
    let mut info = crate::domain::models::test_access_info(host, port);
    info.vendor = FAKE_VENDOR.into();
    info.model = FAKE_MODEL.into();
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_driver_reports_storages() {
        let plugin = FakeDriverPlugin::new(FakeDriverConfig {
            storage_count: 3,
            ..Default::default()
        });
        let driver = plugin
            .connect(&fake_access_info("10.0.0.1", 8088), &TlsOptions::default())
            .await
            .unwrap();

        let storages = driver.get_storages().await.unwrap();
        assert_eq!(storages.len(), 3);
        assert_eq!(storages[1].serial_number, "FAKE-10.0.0.1-8088-001");
        assert_eq!(plugin.constructions(), 1);
    }

    #[tokio::test]
    async fn test_injected_connect_failure() {
        let plugin = FakeDriverPlugin::default();
        plugin.set_fail_connect(true);
        let access = fake_access_info("10.0.0.1", 8088);
        assert!(plugin.connect(&access, &TlsOptions::default()).await.is_err());

        plugin.set_fail_connect(false);
        assert!(plugin.connect(&access, &TlsOptions::default()).await.is_ok());
        assert_eq!(plugin.constructions(), 2);
    }

    #[tokio::test]
    async fn test_capabilities_can_be_empty() {
        let plugin = FakeDriverPlugin::new(FakeDriverConfig {
            with_metrics: false,
            ..Default::default()
        });
        let driver = plugin
            .connect(&fake_access_info("10.0.0.1", 8088), &TlsOptions::default())
            .await
            .unwrap();
        let caps = driver.get_capabilities().await.unwrap();
        assert!(caps.resource_metrics.is_empty());
    }

    #[tokio::test]
    async fn test_perf_metrics_follow_declaration() {
        let driver = FakeDriverPlugin::default()
            .connect(&fake_access_info("10.0.0.1", 8088), &TlsOptions::default())
            .await
            .unwrap();
        let caps = driver.get_capabilities().await.unwrap();
        let now = Utc::now();
        let samples = driver
            .collect_perf_metrics("SN1", &caps.resource_metrics, now, now)
            .await
            .unwrap();
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.resource_id == "SN1"));
    }
}
