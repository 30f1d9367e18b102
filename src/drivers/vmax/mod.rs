//! Dell EMC VMAX / PowerMax Driver
//!
//! Talks to Unisphere over REST. One session can serve every array the
//! Unisphere instance manages, so the driver also backs centralized
//! manager discovery.
//!
//! Recognised `extra_attributes`:
//! - `scheme`: `https` (default) or `http`
//! - `array_id`: array reported by `get_storage`; defaults to the first one

pub mod client;

pub use client::VmaxClient;

use crate::domain::models::{
    AccessInfo, Alert, AlertQuery, Capabilities, Controller, Disk, Filesystem, MetricSample,
    MetricSpec, Port, Qtree, Quota, ResourceMetrics, ResourceStatus, Share, Storage, StoragePool,
    StorageStatus, Volume,
};
use crate::domain::ports::{StorageDriver, StorageDriverRef};
use crate::drivers::ssl::TlsOptions;
use crate::drivers::DriverPlugin;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use client::PerformanceQuery;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub const VENDOR: &str = "Dell EMC";
pub const MODEL: &str = "VMAX";
pub(crate) const DRIVER_NAME: &str = "Dell EMC VMAX";

const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = MIB * 1024.0;
const TIB: f64 = GIB * 1024.0;

/// Array level metrics: (name, Unisphere metric, unit, description)
const ARRAY_METRICS: [(&str, &str, &str, &str); 7] = [
    (
        "throughput",
        "HostMBs",
        "MB/s",
        "Represents how much data is successfully transferred in MB/s",
    ),
    (
        "responseTime",
        "ResponseTime",
        "ms",
        "Average time taken for an IO operation in ms",
    ),
    (
        "requests",
        "HostIOs",
        "IOPS",
        "Input/output operations per second",
    ),
    (
        "readThroughput",
        "HostMBReads",
        "MB/s",
        "Represents how much data read is successfully transferred in MB/s",
    ),
    (
        "writeThroughput",
        "HostMBWritten",
        "MB/s",
        "Represents how much data write is successfully transferred in MB/s",
    ),
    ("readRequests", "HostReads", "IOPS", "Read requests per second"),
    ("writeRequests", "HostWrites", "IOPS", "Write requests per second"),
];

// =============================================================================
// Plugin
// =============================================================================

/// Plugin registered as `"Dell EMC VMAX"`
#[derive(Debug, Default)]
pub struct VmaxDriverPlugin;

#[async_trait]
impl DriverPlugin for VmaxDriverPlugin {
    fn name(&self) -> String {
        DRIVER_NAME.to_string()
    }

    async fn connect(&self, access: &AccessInfo, tls: &TlsOptions) -> Result<StorageDriverRef> {
        let rest = access.rest.as_ref().ok_or_else(|| {
            Error::InvalidAccessInfo(format!("{} requires rest access", DRIVER_NAME))
        })?;
        let scheme = access
            .extra_attributes
            .get("scheme")
            .map(String::as_str)
            .unwrap_or("https");

        let client = VmaxClient::connect(rest, scheme, tls).await?;

        let array_id = match access.extra_attributes.get("array_id") {
            Some(id) => id.clone(),
            None => client
                .list_array_ids()
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| Error::DriverOperation {
                    driver: DRIVER_NAME.into(),
                    operation: "connect".into(),
                    reason: "Unisphere manages no arrays".into(),
                })?,
        };

        info!(
            "Connected to Unisphere v{} at {}:{} (array {})",
            client.version(),
            rest.host,
            rest.port,
            array_id
        );

        Ok(Arc::new(VmaxStorageDriver { client, array_id }))
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Session against one Unisphere instance
#[derive(Debug)]
pub struct VmaxStorageDriver {
    client: VmaxClient,
    /// Array reported by `get_storage`
    array_id: String,
}

impl VmaxStorageDriver {
    async fn storage_for(&self, array_id: &str) -> Result<Storage> {
        let details = self.client.get_array_details(array_id).await?;
        let slo = self.client.get_slo_array(array_id).await?;
        let capacity = &slo.system_capacity;

        let total = tib(capacity.usable_total_tb);
        let used = tib(capacity.usable_used_tb);

        Ok(Storage {
            id: String::new(),
            name: details
                .display_name
                .unwrap_or_else(|| format!("{} {}", details.model, array_id)),
            vendor: VENDOR.into(),
            model: details.model,
            serial_number: array_id.to_string(),
            firmware_version: details.ucode,
            status: StorageStatus::Normal,
            location: String::new(),
            description: String::new(),
            total_capacity: total,
            used_capacity: used,
            free_capacity: total.saturating_sub(used),
            raw_capacity: (slo.physical_capacity.total_capacity_gb * GIB) as u64,
            subscribed_capacity: tib(capacity.subscribed_total_tb),
        })
    }
}

#[async_trait]
impl StorageDriver for VmaxStorageDriver {
    async fn get_storage(&self) -> Result<Storage> {
        self.storage_for(&self.array_id).await
    }

    async fn get_storages(&self) -> Result<Vec<Storage>> {
        let mut storages = Vec::new();
        for array_id in self.client.list_array_ids().await? {
            storages.push(self.storage_for(&array_id).await?);
        }
        Ok(storages)
    }

    async fn list_storage_pools(&self, serial_number: &str) -> Result<Vec<StoragePool>> {
        Ok(self
            .client
            .list_srps(serial_number)
            .await?
            .into_iter()
            .map(|srp| {
                let total = tib(srp.srp_capacity.usable_total_tb);
                let used = tib(srp.srp_capacity.usable_used_tb);
                StoragePool {
                    native_id: srp.srp_id.clone(),
                    name: srp.srp_id,
                    status: ResourceStatus::Normal,
                    total_capacity: total,
                    used_capacity: used,
                    free_capacity: total.saturating_sub(used),
                }
            })
            .collect())
    }

    async fn list_volumes(&self, serial_number: &str) -> Result<Vec<Volume>> {
        Ok(self
            .client
            .list_volumes(serial_number)
            .await?
            .into_iter()
            .map(|v| Volume {
                native_id: v.volume_id.clone(),
                name: v.volume_id,
                status: match v.status.as_str() {
                    "Ready" => ResourceStatus::Normal,
                    "Not Ready" => ResourceStatus::Offline,
                    _ => ResourceStatus::Abnormal,
                },
                native_pool_id: None,
                wwn: v.wwn,
                total_capacity: (v.cap_mb * MIB) as u64,
                used_capacity: 0,
            })
            .collect())
    }

    async fn list_controllers(&self, serial_number: &str) -> Result<Vec<Controller>> {
        Ok(self
            .client
            .list_directors(serial_number)
            .await?
            .into_iter()
            .map(|d| Controller {
                native_id: d.director_id.clone(),
                name: d.director_id,
                status: on_off_status(&d.availability),
                soft_version: None,
                cpu_count: d.num_of_cores,
            })
            .collect())
    }

    async fn list_ports(&self, serial_number: &str) -> Result<Vec<Port>> {
        let mut ports = Vec::new();
        for director in self.client.list_directors(serial_number).await? {
            for (key, info) in self
                .client
                .list_ports(serial_number, &director.director_id)
                .await?
            {
                ports.push(Port {
                    native_id: format!("{}:{}", key.director_id, key.port_id),
                    name: format!("{}:{}", key.director_id, key.port_id),
                    native_controller_id: Some(key.director_id),
                    status: on_off_status(&info.port_status),
                    port_type: port_type(&info.port_type),
                    speed_gbps: info.max_speed.as_deref().and_then(|s| s.parse().ok()),
                    ip_addresses: info.ip_addresses,
                });
            }
        }
        Ok(ports)
    }

    async fn list_disks(&self, _serial_number: &str) -> Result<Vec<Disk>> {
        Ok(Vec::new())
    }

    async fn list_filesystems(&self, _serial_number: &str) -> Result<Vec<Filesystem>> {
        Ok(Vec::new())
    }

    async fn list_qtrees(&self, _serial_number: &str) -> Result<Vec<Qtree>> {
        Ok(Vec::new())
    }

    async fn list_shares(&self, _serial_number: &str) -> Result<Vec<Share>> {
        Ok(Vec::new())
    }

    async fn list_quotas(&self, _serial_number: &str) -> Result<Vec<Quota>> {
        Ok(Vec::new())
    }

    async fn parse_alert(&self, _alert: &BTreeMap<String, String>) -> Result<Alert> {
        Err(Error::Unsupported {
            driver: DRIVER_NAME.into(),
            operation: "parse_alert".into(),
        })
    }

    async fn clear_alert(&self, _sequence_number: &str) -> Result<()> {
        Err(Error::Unsupported {
            driver: DRIVER_NAME.into(),
            operation: "clear_alert".into(),
        })
    }

    async fn list_alerts(&self, _query: &AlertQuery) -> Result<Vec<Alert>> {
        Ok(Vec::new())
    }

    async fn collect_perf_metrics(
        &self,
        serial_number: &str,
        resource_metrics: &ResourceMetrics,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>> {
        let requested: Vec<_> = ARRAY_METRICS
            .iter()
            .filter(|(name, ..)| {
                resource_metrics
                    .get("storage")
                    .map_or(false, |m| m.contains_key(*name))
            })
            .collect();
        if requested.is_empty() {
            return Ok(Vec::new());
        }

        let query = PerformanceQuery {
            symmetrix_id: serial_number,
            start_date: start_time.timestamp_millis(),
            end_date: end_time.timestamp_millis(),
            data_format: "Average",
            metrics: requested.iter().map(|(_, remote, ..)| *remote).collect(),
        };

        let mut samples = Vec::new();
        for row in self.client.array_performance(&query).await? {
            let timestamp = row
                .get("timestamp")
                .and_then(|t| t.as_i64())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or(end_time);
            for (name, remote, unit, _) in &requested {
                if let Some(value) = row.get(*remote).and_then(|v| v.as_f64()) {
                    samples.push(MetricSample {
                        resource_type: "storage".into(),
                        resource_id: serial_number.to_string(),
                        metric: name.to_string(),
                        unit: unit.to_string(),
                        timestamp,
                        value,
                    });
                }
            }
        }
        Ok(samples)
    }

    async fn get_capabilities(&self) -> Result<Capabilities> {
        Ok(capabilities())
    }
}

/// Static telemetry declaration of the driver
pub fn capabilities() -> Capabilities {
    let storage = ARRAY_METRICS
        .iter()
        .map(|(name, _, unit, description)| {
            (
                name.to_string(),
                MetricSpec {
                    unit: unit.to_string(),
                    description: description.to_string(),
                },
            )
        })
        .collect();

    let mut resource_metrics = ResourceMetrics::new();
    resource_metrics.insert("storage".to_string(), storage);
    Capabilities {
        is_historic: true,
        resource_metrics,
    }
}

fn tib(value: f64) -> u64 {
    (value * TIB) as u64
}

fn on_off_status(value: &str) -> ResourceStatus {
    match value {
        "ON" | "Online" => ResourceStatus::Normal,
        "OFF" | "Offline" => ResourceStatus::Offline,
        "" => ResourceStatus::Unknown,
        _ => ResourceStatus::Abnormal,
    }
}

fn port_type(value: &str) -> String {
    match value {
        "GigE" => "eth".to_string(),
        "FibreChannel" => "fc".to_string(),
        other => other.to_lowercase(),
    }
}
