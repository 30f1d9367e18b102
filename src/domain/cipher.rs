//! Credential Ciphers

use crate::domain::ports::CredentialCipher;
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Reversible encoding of stored passwords
///
/// Keeps passwords out of plain sight in the record store; deployments
/// needing real encryption plug in their own [`CredentialCipher`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64Cipher;

impl CredentialCipher for Base64Cipher {
    fn encrypt(&self, plain: &str) -> Result<String> {
        Ok(STANDARD.encode(plain.as_bytes()))
    }

    fn decrypt(&self, encrypted: &str) -> Result<String> {
        let bytes = STANDARD
            .decode(encrypted)
            .map_err(|e| Error::InvalidAccessInfo(format!("undecodable password: {}", e)))?;
        String::from_utf8(bytes)
            .map_err(|e| Error::InvalidAccessInfo(format!("password is not UTF-8: {}", e)))
    }
}
