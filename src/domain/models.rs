//! Domain Models
//!
//! Records exchanged between the orchestrators, the vendor drivers and the
//! persistence seams: connection credentials, centralized managers, storages
//! and the inventory/telemetry records drivers report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{Error, Result};

// =============================================================================
// Access Protocols
// =============================================================================

/// Management protocols a driver may use to reach a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Rest,
    Ssh,
    Smis,
}

impl Protocol {
    /// All protocols, in fingerprint order
    pub const ALL: [Protocol; 3] = [Protocol::Rest, Protocol::Ssh, Protocol::Smis];
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Rest => write!(f, "rest"),
            Protocol::Ssh => write!(f, "ssh"),
            Protocol::Smis => write!(f, "smis"),
        }
    }
}

/// Network endpoint of one protocol, without credentials
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// Connection parameters for one protocol
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolAccess {
    /// Hostname or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Login user
    pub username: String,
    /// Password, encrypted once persisted
    pub password: String,
}

impl ProtocolAccess {
    /// Endpoint without the credential fields
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

impl std::fmt::Debug for ProtocolAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolAccess")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"******")
            .finish()
    }
}

// =============================================================================
// Access Info
// =============================================================================

/// One set of connection credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessInfo {
    /// Storage this credential belongs to (the CM id for the CM's own record)
    #[serde(default)]
    pub storage_id: String,
    /// Managing entity the driver session is cached under
    #[serde(default)]
    pub driver_id: String,
    pub vendor: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest: Option<ProtocolAccess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<ProtocolAccess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smis: Option<ProtocolAccess>,
    /// Vendor specific, non-secret attributes
    #[serde(default)]
    pub extra_attributes: BTreeMap<String, String>,
}

impl AccessInfo {
    /// Protocol blocks present on this record, in fingerprint order
    pub fn protocols(&self) -> impl Iterator<Item = (Protocol, &ProtocolAccess)> {
        Protocol::ALL
            .into_iter()
            .filter_map(move |p| self.protocol(p).map(|access| (p, access)))
    }

    /// Get the block for one protocol
    pub fn protocol(&self, protocol: Protocol) -> Option<&ProtocolAccess> {
        match protocol {
            Protocol::Rest => self.rest.as_ref(),
            Protocol::Ssh => self.ssh.as_ref(),
            Protocol::Smis => self.smis.as_ref(),
        }
    }

    /// Name the plugin registry is keyed by
    pub fn driver_name(&self) -> String {
        format!("{} {}", self.vendor, self.model)
    }

    /// Host of the first configured protocol
    pub fn primary_host(&self) -> Result<&str> {
        self.protocols()
            .map(|(_, access)| access.host.as_str())
            .next()
            .ok_or_else(|| Error::InvalidAccessInfo("no access protocol configured".into()))
    }

    /// Validate the request shape before any device is contacted
    pub fn validate(&self) -> Result<()> {
        if self.vendor.trim().is_empty() || self.model.trim().is_empty() {
            return Err(Error::InvalidAccessInfo(
                "vendor and model are required".into(),
            ));
        }
        if self.protocols().next().is_none() {
            return Err(Error::InvalidAccessInfo(
                "one of rest, ssh or smis is required".into(),
            ));
        }
        for (protocol, access) in self.protocols() {
            if access.host.trim().is_empty() {
                return Err(Error::InvalidAccessInfo(format!("{} host is empty", protocol)));
            }
            if access.port == 0 {
                return Err(Error::InvalidAccessInfo(format!("{} port is 0", protocol)));
            }
        }
        Ok(())
    }

    /// Secret-free filter identifying the physical endpoint
    pub fn connection_filter(&self) -> AccessInfoFilter {
        AccessInfoFilter {
            driver_id: None,
            vendor: Some(self.vendor.clone()),
            model: Some(self.model.clone()),
            rest: self.rest.as_ref().map(ProtocolAccess::endpoint),
            ssh: self.ssh.as_ref().map(ProtocolAccess::endpoint),
            smis: self.smis.as_ref().map(ProtocolAccess::endpoint),
        }
    }

    /// Copy with every password transformed by `f`
    pub fn map_passwords<F>(&self, f: F) -> Result<AccessInfo>
    where
        F: Fn(&str) -> Result<String>,
    {
        let mut out = self.clone();
        for access in [&mut out.rest, &mut out.ssh, &mut out.smis]
            .into_iter()
            .flatten()
        {
            access.password = f(&access.password)?;
        }
        Ok(out)
    }
}

/// Equality filter over the non-secret fields of [`AccessInfo`]
///
/// `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessInfoFilter {
    pub driver_id: Option<String>,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub rest: Option<Endpoint>,
    pub ssh: Option<Endpoint>,
    pub smis: Option<Endpoint>,
}

impl AccessInfoFilter {
    /// Filter on the managing entity only
    pub fn by_driver_id(driver_id: impl Into<String>) -> Self {
        Self {
            driver_id: Some(driver_id.into()),
            ..Default::default()
        }
    }

    /// Check a record against this filter
    pub fn matches(&self, info: &AccessInfo) -> bool {
        fn field_eq(want: &Option<String>, have: &str) -> bool {
            want.as_deref().map_or(true, |w| w == have)
        }
        fn endpoint_eq(want: &Option<Endpoint>, have: Option<&ProtocolAccess>) -> bool {
            match want {
                None => true,
                Some(w) => have.map_or(false, |h| h.host == w.host && h.port == w.port),
            }
        }

        field_eq(&self.driver_id, &info.driver_id)
            && field_eq(&self.vendor, &info.vendor)
            && field_eq(&self.model, &info.model)
            && endpoint_eq(&self.rest, info.rest.as_ref())
            && endpoint_eq(&self.ssh, info.ssh.as_ref())
            && endpoint_eq(&self.smis, info.smis.as_ref())
    }
}

// =============================================================================
// Centralized Manager
// =============================================================================

/// A management endpoint fronting several storages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentralizedManager {
    pub id: String,
    /// Content hash of the connection identity
    pub derived_id: String,
    pub vendor: String,
    pub model: String,
    /// Owned storage ids, in discovery order
    pub storages: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl CentralizedManager {
    /// Fingerprint of vendor, model and every protocol's host and port
    pub fn derive_id(access: &AccessInfo) -> String {
        let mut encoded = format!("{}{}", access.vendor, access.model);
        for (_, protocol) in access.protocols() {
            encoded.push_str(&protocol.host);
            encoded.push_str(&protocol.port.to_string());
        }
        let digest = Sha256::digest(encoded.as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

// =============================================================================
// Storage
// =============================================================================

/// Vendor reported status of a storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageStatus {
    Normal,
    Abnormal,
    Degraded,
    Offline,
    #[default]
    Unknown,
}

impl std::fmt::Display for StorageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageStatus::Normal => write!(f, "normal"),
            StorageStatus::Abnormal => write!(f, "abnormal"),
            StorageStatus::Degraded => write!(f, "degraded"),
            StorageStatus::Offline => write!(f, "offline"),
            StorageStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// One physical or virtual array
///
/// Drivers report storages with an empty `id`; discovery assigns it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Storage {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: String,
    #[serde(default)]
    pub firmware_version: String,
    #[serde(default)]
    pub status: StorageStatus,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub description: String,
    /// Capacities in bytes
    #[serde(default)]
    pub total_capacity: u64,
    #[serde(default)]
    pub used_capacity: u64,
    #[serde(default)]
    pub free_capacity: u64,
    #[serde(default)]
    pub raw_capacity: u64,
    #[serde(default)]
    pub subscribed_capacity: u64,
}

impl Storage {
    /// Two records describe the same physical device
    pub fn is_same_device(&self, other: &Storage) -> bool {
        self.serial_number == other.serial_number
            && self.vendor == other.vendor
            && self.model == other.model
    }
}

// =============================================================================
// Sync State
// =============================================================================

/// Per-storage full-sync gate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub is_syncing: bool,
    pub remaining_resource_count: u32,
    pub started_at: Option<DateTime<Utc>>,
}

impl SyncState {
    /// State of a storage that is not syncing
    pub fn idle() -> Self {
        Self::default()
    }

    /// A sync running longer than `expiration` is treated as abandoned
    pub fn is_expired(&self, expiration: Duration, now: DateTime<Utc>) -> bool {
        match self.started_at {
            Some(started) if self.is_syncing => {
                let age = now.signed_duration_since(started);
                age.to_std().map_or(false, |age| age > expiration)
            }
            _ => false,
        }
    }
}

// =============================================================================
// Inventory Records
// =============================================================================

/// Status of an inventory resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Normal,
    Abnormal,
    Offline,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoragePool {
    pub native_id: String,
    pub name: String,
    pub status: ResourceStatus,
    pub total_capacity: u64,
    pub used_capacity: u64,
    pub free_capacity: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub native_id: String,
    pub name: String,
    pub status: ResourceStatus,
    pub native_pool_id: Option<String>,
    pub wwn: Option<String>,
    pub total_capacity: u64,
    pub used_capacity: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Controller {
    pub native_id: String,
    pub name: String,
    pub status: ResourceStatus,
    pub soft_version: Option<String>,
    pub cpu_count: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub native_id: String,
    pub name: String,
    pub native_controller_id: Option<String>,
    pub status: ResourceStatus,
    pub port_type: String,
    /// Speed in Gbps
    pub speed_gbps: Option<u32>,
    pub ip_addresses: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Disk {
    pub native_id: String,
    pub name: String,
    pub serial_number: String,
    pub status: ResourceStatus,
    pub physical_type: String,
    pub capacity: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filesystem {
    pub native_id: String,
    pub name: String,
    pub native_pool_id: Option<String>,
    pub status: ResourceStatus,
    pub total_capacity: u64,
    pub used_capacity: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Qtree {
    pub native_id: String,
    pub name: String,
    pub native_filesystem_id: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Share {
    pub native_id: String,
    pub name: String,
    pub native_filesystem_id: String,
    /// cifs, nfs, ftp...
    pub protocol: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    pub native_id: String,
    pub quota_type: String,
    pub native_filesystem_id: String,
    pub capacity_hard_limit: Option<u64>,
    pub file_hard_limit: Option<u64>,
}

// =============================================================================
// Alerts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Fatal,
    Critical,
    Major,
    Minor,
    Warning,
    Informational,
}

/// Alert as normalised by a driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub alert_name: String,
    pub severity: AlertSeverity,
    pub category: String,
    pub description: String,
    pub sequence_number: String,
    pub resource_type: String,
    pub occur_time: DateTime<Utc>,
}

/// Time window for alert listing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertQuery {
    pub begin_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

// =============================================================================
// Telemetry
// =============================================================================

/// Unit and meaning of one metric a driver can report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub unit: String,
    pub description: String,
}

/// Metrics a driver can report, keyed by resource category then metric name
pub type ResourceMetrics = BTreeMap<String, BTreeMap<String, MetricSpec>>;

/// Telemetry declaration of a driver
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub is_historic: bool,
    #[serde(default)]
    pub resource_metrics: ResourceMetrics,
}

impl Capabilities {
    /// Check the declaration before enabling performance monitoring
    ///
    /// An empty declaration yields [`Error::EmptyResourceMetrics`], which
    /// callers treat as "no telemetry available".
    pub fn validate(&self, storage_id: &str) -> Result<()> {
        let metric_count: usize = self.resource_metrics.values().map(BTreeMap::len).sum();
        if metric_count == 0 {
            return Err(Error::EmptyResourceMetrics {
                storage_id: storage_id.to_string(),
            });
        }
        for (category, metrics) in &self.resource_metrics {
            for (name, spec) in metrics {
                if spec.unit.trim().is_empty() {
                    return Err(Error::InvalidCapabilities(format!(
                        "metric {}.{} has no unit",
                        category, name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One collected metric value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub resource_type: String,
    pub resource_id: String,
    pub metric: String,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[cfg(test)]
pub(crate) fn test_access_info(host: &str, port: u16) -> AccessInfo {
    AccessInfo {
        storage_id: String::new(),
        driver_id: String::new(),
        vendor: "Dell EMC".into(),
        model: "VMAX".into(),
        rest: Some(ProtocolAccess {
            host: host.into(),
            port,
            username: "admin".into(),
            password: "secret".into(),
        }),
        ssh: None,
        smis: None,
        extra_attributes: BTreeMap::new(),
    }
}
