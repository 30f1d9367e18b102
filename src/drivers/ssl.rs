//! Certificate Material
//!
//! Loading of the CA bundle used to verify vendor management endpoints.
//! A bundle is either a single PEM file or a directory of `*.pem` / `*.crt`
//! files.

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

// =============================================================================
// CA Bundle
// =============================================================================

/// Validated set of PEM encoded CA certificates
#[derive(Debug, Clone)]
pub struct CaBundle {
    path: PathBuf,
    /// One PEM block per certificate
    certificates: Vec<String>,
}

impl CaBundle {
    /// Load and validate every certificate under `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        verify_ca_path(path)?;

        let files = if path.is_dir() {
            bundle_files(path)?
        } else {
            vec![path.to_path_buf()]
        };

        let mut certificates = Vec::new();
        for file in &files {
            let text = std::fs::read_to_string(file).map_err(|e| cert_error(file, e))?;
            certificates.extend(split_pem(file, &text)?);
        }

        if certificates.is_empty() {
            return Err(cert_error(path, "no certificates found"));
        }

        debug!(
            "Loaded {} CA certificate(s) from {}",
            certificates.len(),
            path.display()
        );

        Ok(Self {
            path: path.to_path_buf(),
            certificates,
        })
    }

    /// Where the bundle was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// Certificates in the form the HTTP client consumes
    pub fn reqwest_certificates(&self) -> Result<Vec<reqwest::Certificate>> {
        self.certificates
            .iter()
            .map(|pem| {
                reqwest::Certificate::from_pem(pem.as_bytes())
                    .map_err(|e| cert_error(&self.path, e))
            })
            .collect()
    }
}

/// Fail unless `path` exists
pub fn verify_ca_path(path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(cert_error(path, "path does not exist"))
    }
}

fn bundle_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for ext in ["pem", "crt"] {
        let pattern = dir.join(format!("*.{}", ext));
        let entries = glob::glob(&pattern.to_string_lossy()).map_err(|e| cert_error(dir, e))?;
        for entry in entries {
            files.push(entry.map_err(|e| cert_error(dir, e))?);
        }
    }
    files.sort();
    Ok(files)
}

/// Split a PEM file into certificate blocks, checking each body decodes
fn split_pem(file: &Path, text: &str) -> Result<Vec<String>> {
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find(PEM_BEGIN) {
        let after_begin = &rest[start + PEM_BEGIN.len()..];
        let end = after_begin
            .find(PEM_END)
            .ok_or_else(|| cert_error(file, "unterminated certificate block"))?;

        let body: String = after_begin[..end]
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let der = STANDARD
            .decode(body.as_bytes())
            .map_err(|e| cert_error(file, e))?;
        if der.is_empty() {
            return Err(cert_error(file, "empty certificate block"));
        }

        blocks.push(format!("{}\n{}\n{}\n", PEM_BEGIN, body, PEM_END));
        rest = &after_begin[end + PEM_END.len()..];
    }

    Ok(blocks)
}

fn cert_error(path: &Path, reason: impl std::fmt::Display) -> Error {
    Error::Certificate {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

// =============================================================================
// TLS Options
// =============================================================================

/// Verification settings handed to a driver plugin on connect
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Verify the endpoint's certificate
    pub verify: bool,
    /// Extra trust roots
    pub ca_bundle: Option<Arc<CaBundle>>,
}

impl TlsOptions {
    /// No certificate verification
    pub fn insecure() -> Self {
        Self::default()
    }

    /// Verify against `bundle`
    pub fn with_bundle(bundle: CaBundle) -> Self {
        Self {
            verify: true,
            ca_bundle: Some(Arc::new(bundle)),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_pem(payload: &[u8]) -> String {
    format!("{}\n{}\n{}\n", PEM_BEGIN, STANDARD.encode(payload), PEM_END)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_load_single_file_with_two_certificates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}{}", test_pem(b"first-der"), test_pem(b"second-der")).unwrap();

        let bundle = CaBundle::load(file.path()).unwrap();
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.path(), file.path());
    }

    #[test]
    fn test_load_directory_globs_pem_and_crt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.pem"), test_pem(b"a")).unwrap();
        std::fs::write(dir.path().join("b.crt"), test_pem(b"b")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a certificate").unwrap();

        let bundle = CaBundle::load(dir.path()).unwrap();
        assert_eq!(bundle.len(), 2);
    }

    #[test]
    fn test_empty_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(CaBundle::load(dir.path()), Err(Error::Certificate { .. }));
    }

    #[test]
    fn test_missing_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.pem");
        assert_matches!(verify_ca_path(&missing), Err(Error::Certificate { .. }));
        assert_matches!(CaBundle::load(&missing), Err(Error::Certificate { .. }));
    }

    #[test]
    fn test_corrupt_block_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}\n!!not base64!!\n{}\n", PEM_BEGIN, PEM_END).unwrap();
        assert_matches!(CaBundle::load(file.path()), Err(Error::Certificate { .. }));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}\nYWJj\n", PEM_BEGIN).unwrap();
        assert_matches!(CaBundle::load(file.path()), Err(Error::Certificate { .. }));
    }
}
