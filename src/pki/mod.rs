//! PKI operations for the agent's client certificate
//!
//! The agent never lets its private key leave the cluster: it generates an
//! RSA key pair locally, sends only a CSR to the central connector, and
//! receives the signed certificate chain plus the connector's CA back.
//!
//! # Layout
//!
//! - [`subject`] - Distinguished name parsing and conversion
//! - [`csr`] - Key reuse/generation and CSR construction
//! - [`bundle`] - Decoding the certificates returned by the connector

pub mod bundle;
pub mod csr;
pub mod subject;

use chrono::{DateTime, Utc};
use thiserror::Error;
use x509_parser::prelude::*;

pub use bundle::CertificateBundle;
pub use csr::{CertificateRequest, CsrProvider, RsaCsrProvider};
pub use subject::Subject;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// CSR construction failed
    #[error("CSR generation failed: {0}")]
    CsrGenerationFailed(String),

    /// Certificate or key parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Base64 decoding of a certificate field failed
    #[error("failed to decode {field}: {message}")]
    Decode {
        /// Response field that failed to decode
        field: &'static str,
        /// Decoder error message
        message: String,
    },

    /// The key record could not be read or written
    #[error("key store error: {0}")]
    Store(#[from] crate::secrets::StoreError),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes of the first block
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Validity window and subject of a certificate
#[derive(Clone, Debug, PartialEq)]
pub struct CertificateInfo {
    /// When the certificate becomes valid
    pub not_before: DateTime<Utc>,
    /// When the certificate expires
    pub not_after: DateTime<Utc>,
    /// Subject distinguished name
    pub subject: Subject,
}

impl CertificateInfo {
    /// Parse the leaf certificate of a PEM chain
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        Ok(Self {
            not_before: to_utc(cert.validity().not_before.timestamp())?,
            not_after: to_utc(cert.validity().not_after.timestamp())?,
            subject: Subject::from_x509_name(cert.subject()),
        })
    }

    /// Total validity of the certificate
    pub fn validity(&self) -> chrono::Duration {
        self.not_after - self.not_before
    }

    /// Time left until expiry, negative once expired
    pub fn remaining_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.not_after - now
    }
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| PkiError::ParseError(format!("timestamp {} out of range", timestamp)))
}
