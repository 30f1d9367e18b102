//! Service Configuration
//!
//! One YAML document with a section per component. Every section is
//! optional and falls back to its defaults.

use crate::controlplane::{ApiServerConfig, DiscoveryConfig, SyncConfig};
use crate::coordination::CoordinationConfig;
use crate::drivers::DriverManagerConfig;
use crate::error::Result;
use crate::tasks::TaskConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Configuration of the whole service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub api: ApiServerConfig,
    pub drivers: DriverManagerConfig,
    pub discovery: DiscoveryConfig,
    pub sync: SyncConfig,
    pub coordination: CoordinationConfig,
    pub tasks: TaskConfig,
}

impl ServiceConfig {
    /// Load from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse a YAML document
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::LockBackend;
    use crate::error::Error;
    use assert_matches::assert_matches;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.discovery.lock_timeout_secs, 30);
        assert_eq!(config.sync.expiration_secs, 1800);
        assert_eq!(config.tasks.queue_capacity, 1024);
        assert_eq!(config.coordination.backend, LockBackend::Local);
        assert!(config.drivers.ca_path.is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "drivers:\n  ca_path: /etc/ssl/arrays\ncoordination:\n  backend: kubernetes\n  namespace: storage\nsync:\n  periodic_interval_secs: 600"
        )
        .unwrap();

        let config = ServiceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.drivers.ca_path, Some(PathBuf::from("/etc/ssl/arrays")));
        assert_eq!(config.coordination.backend, LockBackend::Kubernetes);
        assert_eq!(config.coordination.namespace, "storage");
        assert_eq!(config.coordination.lease_duration_secs, 60);
        assert_eq!(config.sync.periodic_interval_secs, 600);
        assert_eq!(config.sync.expiration_secs, 1800);
    }

    #[test]
    fn test_empty_document() {
        let config = ServiceConfig::from_yaml("").unwrap();
        assert_eq!(config.api.rest_addr.port(), 8090);
    }

    #[test]
    fn test_invalid_documents() {
        assert_matches!(
            ServiceConfig::from_yaml("coordination:\n  backend: zookeeper"),
            Err(Error::YamlParse(_))
        );
        assert_matches!(
            ServiceConfig::from_file("/nonexistent/service.yaml"),
            Err(Error::Io(_))
        );
    }
}
