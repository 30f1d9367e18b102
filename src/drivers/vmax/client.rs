//! Unisphere REST Client
//!
//! Thin typed wrapper over the Unisphere for PowerMax REST API. Paths are
//! relative to `<scheme>://<host>:<port>/univmax/restapi`.

use crate::domain::models::ProtocolAccess;
use crate::drivers::ssl::TlsOptions;
use crate::error::{Error, Result};
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::DRIVER_NAME;

/// Request timeout for a single API call
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Response Models
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct VersionInfo {
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct SymmetrixList {
    #[serde(rename = "symmetrixId", default)]
    pub symmetrix_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ArrayDetails {
    pub model: String,
    pub ucode: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SystemCapacity {
    #[serde(default)]
    pub usable_total_tb: f64,
    #[serde(default)]
    pub usable_used_tb: f64,
    #[serde(default)]
    pub subscribed_total_tb: f64,
}

#[derive(Debug, Default, Deserialize)]
pub struct PhysicalCapacity {
    #[serde(default)]
    pub total_capacity_gb: f64,
}

#[derive(Debug, Deserialize)]
pub struct SloArray {
    #[serde(default)]
    pub system_capacity: SystemCapacity,
    #[serde(rename = "physicalCapacity", default)]
    pub physical_capacity: PhysicalCapacity,
}

#[derive(Debug, Deserialize)]
pub struct SrpList {
    #[serde(rename = "srpId", default)]
    pub srp_ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SrpCapacity {
    #[serde(default)]
    pub usable_total_tb: f64,
    #[serde(default)]
    pub usable_used_tb: f64,
}

#[derive(Debug, Deserialize)]
pub struct Srp {
    #[serde(rename = "srpId")]
    pub srp_id: String,
    #[serde(default)]
    pub srp_capacity: SrpCapacity,
}

#[derive(Debug, Deserialize)]
pub struct VolumeKey {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct VolumeResults {
    #[serde(default)]
    pub result: Vec<VolumeKey>,
}

#[derive(Debug, Deserialize)]
pub struct VolumeList {
    #[serde(rename = "resultList", default)]
    pub result_list: VolumeResults,
}

#[derive(Debug, Deserialize)]
pub struct VolumeDetail {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(default)]
    pub cap_mb: f64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub wwn: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DirectorList {
    #[serde(rename = "directorId", default)]
    pub director_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct Director {
    #[serde(rename = "directorId")]
    pub director_id: String,
    #[serde(default)]
    pub availability: String,
    #[serde(default)]
    pub num_of_cores: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PortKey {
    #[serde(rename = "directorId")]
    pub director_id: String,
    #[serde(rename = "portId")]
    pub port_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PortList {
    #[serde(rename = "symmetrixPortKey", default)]
    pub keys: Vec<PortKey>,
}

#[derive(Debug, Deserialize)]
pub struct PortInfo {
    #[serde(default)]
    pub port_status: String,
    #[serde(rename = "type", default)]
    pub port_type: String,
    #[serde(default)]
    pub max_speed: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct PortDetail {
    #[serde(rename = "symmetrixPort")]
    pub port: PortInfo,
}

/// Body of an array performance query
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceQuery<'a> {
    pub symmetrix_id: &'a str,
    /// Epoch milliseconds
    pub start_date: i64,
    pub end_date: i64,
    pub data_format: &'a str,
    pub metrics: Vec<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PerformanceResults {
    #[serde(default)]
    pub result: Vec<BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
pub struct PerformanceResponse {
    #[serde(rename = "resultList", default)]
    pub result_list: PerformanceResults,
}

// =============================================================================
// Client
// =============================================================================

/// Authenticated session against one Unisphere instance
#[derive(Debug, Clone)]
pub struct VmaxClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    /// Short API version, e.g. "92"
    version: String,
}

impl VmaxClient {
    /// Build the HTTP client and resolve the API version
    pub async fn connect(access: &ProtocolAccess, scheme: &str, tls: &TlsOptions) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(!tls.verify);
        if let Some(bundle) = &tls.ca_bundle {
            for cert in bundle.reqwest_certificates()? {
                builder = builder.add_root_certificate(cert);
            }
        }

        let mut client = Self {
            http: builder.build()?,
            base_url: format!("{}://{}:{}/univmax/restapi", scheme, access.host, access.port),
            username: access.username.clone(),
            password: access.password.clone(),
            version: String::new(),
        };

        let info: VersionInfo = client.get("version").await?;
        client.version = short_version(&info.version)?;
        debug!("Connected to Unisphere {} at {}", info.version, client.base_url);

        Ok(client)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub async fn list_array_ids(&self) -> Result<Vec<String>> {
        let list: SymmetrixList = self.get(&self.versioned("system/symmetrix")).await?;
        Ok(list.symmetrix_ids)
    }

    pub async fn get_array_details(&self, array_id: &str) -> Result<ArrayDetails> {
        self.get(&self.versioned(&format!("system/symmetrix/{}", enc(array_id))))
            .await
    }

    pub async fn get_slo_array(&self, array_id: &str) -> Result<SloArray> {
        self.get(&self.versioned(&format!(
            "sloprovisioning/symmetrix/{}",
            enc(array_id)
        )))
        .await
    }

    pub async fn list_srps(&self, array_id: &str) -> Result<Vec<Srp>> {
        let list: SrpList = self
            .get(&self.versioned(&format!(
                "sloprovisioning/symmetrix/{}/srp",
                enc(array_id)
            )))
            .await?;

        let mut srps = Vec::with_capacity(list.srp_ids.len());
        for srp_id in &list.srp_ids {
            srps.push(
                self.get(&self.versioned(&format!(
                    "sloprovisioning/symmetrix/{}/srp/{}",
                    enc(array_id),
                    enc(srp_id)
                )))
                .await?,
            );
        }
        Ok(srps)
    }

    pub async fn list_volumes(&self, array_id: &str) -> Result<Vec<VolumeDetail>> {
        let list: VolumeList = self
            .get(&self.versioned(&format!(
                "sloprovisioning/symmetrix/{}/volume",
                enc(array_id)
            )))
            .await?;

        let mut volumes = Vec::with_capacity(list.result_list.result.len());
        for key in &list.result_list.result {
            volumes.push(
                self.get(&self.versioned(&format!(
                    "sloprovisioning/symmetrix/{}/volume/{}",
                    enc(array_id),
                    enc(&key.volume_id)
                )))
                .await?,
            );
        }
        Ok(volumes)
    }

    pub async fn list_directors(&self, array_id: &str) -> Result<Vec<Director>> {
        let list: DirectorList = self
            .get(&self.versioned(&format!(
                "system/symmetrix/{}/director",
                enc(array_id)
            )))
            .await?;

        let mut directors = Vec::with_capacity(list.director_ids.len());
        for director_id in &list.director_ids {
            directors.push(
                self.get(&self.versioned(&format!(
                    "system/symmetrix/{}/director/{}",
                    enc(array_id),
                    enc(director_id)
                )))
                .await?,
            );
        }
        Ok(directors)
    }

    /// Ports of one director, with their keys
    pub async fn list_ports(
        &self,
        array_id: &str,
        director_id: &str,
    ) -> Result<Vec<(PortKey, PortInfo)>> {
        let list: PortList = self
            .get(&self.versioned(&format!(
                "system/symmetrix/{}/director/{}/port",
                enc(array_id),
                enc(director_id)
            )))
            .await?;

        let mut ports = Vec::with_capacity(list.keys.len());
        for key in list.keys {
            let detail: PortDetail = self
                .get(&self.versioned(&format!(
                    "system/symmetrix/{}/director/{}/port/{}",
                    enc(array_id),
                    enc(&key.director_id),
                    enc(&key.port_id)
                )))
                .await?;
            ports.push((key, detail.port));
        }
        Ok(ports)
    }

    pub async fn array_performance(
        &self,
        query: &PerformanceQuery<'_>,
    ) -> Result<Vec<BTreeMap<String, serde_json::Value>>> {
        let url = format!("{}/performance/Array/metrics", self.base_url);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header(ACCEPT, "application/json")
            .json(query)
            .send()
            .await?;
        let body: PerformanceResponse = decode(response, "performance/Array/metrics").await?;
        Ok(body.result_list.result)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn versioned(&self, path: &str) -> String {
        format!("{}/{}", self.version, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        decode(response, path).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response, path: &str) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        return Err(Error::DriverOperation {
            driver: DRIVER_NAME.into(),
            operation: path.to_string(),
            reason: format!("HTTP {}", status),
        });
    }
    Ok(response.json::<T>().await?)
}

fn enc(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

/// "V9.2.0.1" -> "92"
pub fn short_version(version: &str) -> Result<String> {
    let parts: Vec<&str> = version
        .trim_start_matches(|c: char| c == 'V' || c == 'v')
        .split('.')
        .take(2)
        .collect();
    let numeric = |p: &&str| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit());
    if parts.len() < 2 || !parts.iter().all(numeric) {
        return Err(Error::DriverOperation {
            driver: DRIVER_NAME.into(),
            operation: "version".into(),
            reason: format!("unrecognised Unisphere version {}", version),
        });
    }
    Ok(parts.concat())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_version() {
        assert_eq!(short_version("V9.2.0.1").unwrap(), "92");
        assert_eq!(short_version("10.0").unwrap(), "100");
        assert!(short_version("V9").is_err());
        assert!(short_version("garbage").is_err());
    }

    #[test]
    fn test_port_detail_deserialization() {
        let detail: PortDetail = serde_json::from_str(
            r#"{"symmetrixPort": {"port_status": "PendOn", "type": "GigE",
                "max_speed": "10", "ip_addresses": ["192.168.0.51"]}}"#,
        )
        .unwrap();
        assert_eq!(detail.port.port_type, "GigE");
        assert_eq!(detail.port.ip_addresses, vec!["192.168.0.51".to_string()]);
    }
}
