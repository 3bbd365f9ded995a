//! CSR generation backed by a persisted RSA key
//!
//! The initial handshake may be retried many times before the connector
//! accepts a CSR, so the key behind it is stored in its own record and
//! reused until it is superseded. Renewals always rotate the key; the new
//! key travels with the renewed bundle and is stored next to the certificate.

use async_trait::async_trait;
use base64::prelude::*;
use rcgen::{CertificateParams, KeyPair};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

#[cfg(test)]
use mockall::automock;

use super::{PkiError, Result, Subject};
use crate::config::CertificateConfig;
use crate::secrets::{SecretData, SecretName, SecretRepository, StoreError};
use crate::PRIVATE_KEY_KEY;

/// A CSR ready to send to the connector, with the key it was signed with
#[derive(Clone)]
pub struct CertificateRequest {
    /// Base64 of the PEM encoded CSR
    pub csr: String,
    /// PKCS#8 PEM private key matching the CSR
    pub key_pem: Zeroizing<String>,
}

impl std::fmt::Debug for CertificateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateRequest")
            .field("csr", &self.csr)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Produces CSRs for the connector handshake and renewal
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CsrProvider: Send + Sync {
    /// CSR for the initial handshake, reusing the stored key when it parses
    async fn create_csr(&self, subject: &Subject) -> Result<CertificateRequest>;

    /// CSR for a renewal, always with a freshly generated key
    ///
    /// The key is not written to the key-only record; the caller stores it
    /// together with the renewed certificate.
    async fn renewal_csr(&self, subject: &Subject) -> Result<CertificateRequest>;
}

/// [`CsrProvider`] generating RSA keys and keeping them in the key-only record
pub struct RsaCsrProvider {
    secrets: SecretRepository,
    key_secret: SecretName,
    key_bits: usize,
}

impl RsaCsrProvider {
    /// Create a provider storing its key in `config.csr_key_secret`
    pub fn new(secrets: SecretRepository, config: &CertificateConfig) -> Self {
        Self {
            secrets,
            key_secret: config.csr_key_secret.clone(),
            key_bits: config.rsa_key_bits,
        }
    }

    /// Return the stored key if present and parseable
    async fn stored_key(&self) -> Result<Option<Zeroizing<String>>> {
        let data = match self.secrets.get(&self.key_secret).await {
            Ok(data) => data,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let Some(raw) = data.get(PRIVATE_KEY_KEY) else {
            return Ok(None);
        };

        let pem = String::from_utf8_lossy(raw);
        match normalize_key(&pem) {
            Ok(key) => Ok(Some(key)),
            Err(e) => {
                warn!(
                    secret = %self.key_secret,
                    error = %e,
                    "stored private key is unusable, generating a new one"
                );
                Ok(None)
            }
        }
    }

    async fn generate(&self) -> Result<Zeroizing<String>> {
        let bits = self.key_bits;
        tokio::task::spawn_blocking(move || generate_key(bits))
            .await
            .map_err(|e| {
                PkiError::KeyGenerationFailed(format!("key generation task failed: {}", e))
            })?
    }

    /// Generate a key and replace the key record with it
    async fn generate_and_store(&self) -> Result<Zeroizing<String>> {
        let key_pem = self.generate().await?;

        let mut data = SecretData::new();
        data.insert(PRIVATE_KEY_KEY.to_string(), key_pem.as_bytes().to_vec());
        self.secrets
            .upsert_with_replace(&self.key_secret, data)
            .await?;

        info!(
            secret = %self.key_secret,
            bits = self.key_bits,
            "generated and stored new private key"
        );
        Ok(key_pem)
    }
}

#[async_trait]
impl CsrProvider for RsaCsrProvider {
    async fn create_csr(&self, subject: &Subject) -> Result<CertificateRequest> {
        let key_pem = match self.stored_key().await? {
            Some(key) => {
                debug!(secret = %self.key_secret, "reusing stored private key");
                key
            }
            None => self.generate_and_store().await?,
        };

        let csr = build_csr(subject, &key_pem)?;
        Ok(CertificateRequest { csr, key_pem })
    }

    async fn renewal_csr(&self, subject: &Subject) -> Result<CertificateRequest> {
        let key_pem = self.generate().await?;
        debug!(bits = self.key_bits, "generated renewal key");
        let csr = build_csr(subject, &key_pem)?;
        Ok(CertificateRequest { csr, key_pem })
    }
}

fn generate_key(bits: usize) -> Result<Zeroizing<String>> {
    let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, bits)
        .map_err(|e| PkiError::KeyGenerationFailed(e.to_string()))?;
    key.to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to encode key: {}", e)))
}

/// Parse a PKCS#8 or PKCS#1 RSA key and re-encode it as PKCS#8 PEM
pub fn normalize_key(pem: &str) -> Result<Zeroizing<String>> {
    let key = RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| PkiError::ParseError(format!("invalid RSA private key: {}", e)))?;
    key.to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| PkiError::ParseError(format!("failed to encode key: {}", e)))
}

/// Build the base64 encoded PEM CSR for `subject`, signed with `key_pem`
///
/// PKCS#1 v1.5 signatures make the output deterministic for a key and subject.
pub fn build_csr(subject: &Subject, key_pem: &str) -> Result<String> {
    let key_pair = KeyPair::from_pem_and_sign_algo(key_pem, &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| PkiError::ParseError(format!("failed to load private key: {}", e)))?;

    let mut params = CertificateParams::default();
    params.distinguished_name = subject.to_distinguished_name();

    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| PkiError::CsrGenerationFailed(format!("failed to create CSR: {}", e)))?;
    let csr_pem = csr
        .pem()
        .map_err(|e| PkiError::CsrGenerationFailed(format!("failed to serialize CSR: {}", e)))?;

    Ok(BASE64_STANDARD.encode(csr_pem))
}
