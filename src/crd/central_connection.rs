//! CentralConnection Custom Resource Definition
//!
//! A CentralConnection describes one central connector the agent keeps a
//! valid client certificate for. The spec carries the bootstrap URL and a
//! forced-renewal flag; the status records the certificate validity window
//! and the outcome of the last synchronization.

use chrono::{DateTime, SecondsFormat, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::pki::CertificateInfo;

/// Specification for a CentralConnection
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tether.dev",
    version = "v1alpha1",
    kind = "CentralConnection",
    plural = "centralconnections",
    shortname = "cc",
    status = "CentralConnectionStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Expires","type":"string","jsonPath":".status.certificateStatus.notAfter"}"#,
    printcolumn = r#"{"name":"Last Sync","type":"string","jsonPath":".status.synchronizationStatus.lastSync"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CentralConnectionSpec {
    /// One-time CSR info URL used for the initial handshake
    #[serde(default)]
    pub csr_info_url: String,

    /// Management info URL, overriding the one learned at handshake
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_info_url: Option<String>,

    /// Renew the certificate on the next reconcile regardless of validity
    #[serde(default)]
    pub renew_now: bool,
}

impl CentralConnectionSpec {
    /// Validate the connection specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        validate_url("csrInfoUrl", &self.csr_info_url, true)?;
        if let Some(url) = &self.management_info_url {
            validate_url("managementInfoUrl", url, false)?;
        }
        Ok(())
    }
}

fn validate_url(field: &str, url: &str, allow_empty: bool) -> Result<(), crate::Error> {
    if url.is_empty() {
        if allow_empty {
            return Ok(());
        }
        return Err(crate::Error::validation(format!("{} must not be empty", field)));
    }
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(crate::Error::validation(format!(
            "{} must be an http(s) URL, got '{}'",
            field, url
        )));
    }
    Ok(())
}

/// Connection lifecycle phase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionPhase {
    /// No certificate issued yet
    #[default]
    Disconnected,
    /// Certificate valid and last synchronization succeeded
    Connected,
    /// Certificate renewal in progress
    Renewing,
    /// Last reconcile failed, see `status.error`
    Error,
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connected => write!(f, "Connected"),
            Self::Renewing => write!(f, "Renewing"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Validity window of the current client certificate, RFC 3339
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    /// When the certificate became valid
    pub not_before: String,
    /// When the certificate expires
    pub not_after: String,
}

impl CertificateStatus {
    /// Status for the given certificate
    pub fn from_info(info: &CertificateInfo) -> Self {
        Self {
            not_before: format_time(info.not_before),
            not_after: format_time(info.not_after),
        }
    }

    /// Parsed `(not_before, not_after)`, `None` if either is malformed
    pub fn window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((parse_time(&self.not_before)?, parse_time(&self.not_after)?))
    }
}

/// Timestamps of the last synchronization attempts, RFC 3339
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SynchronizationStatus {
    /// Last synchronization attempt, successful or not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<String>,
    /// Last successful synchronization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success: Option<String>,
}

impl SynchronizationStatus {
    /// Parsed `last_sync`
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.last_sync.as_deref().and_then(parse_time)
    }
}

/// Error recorded by the last failed reconcile
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct StatusError {
    /// `"<stage> failed: <cause>"`
    pub message: String,
}

/// Status for a CentralConnection
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CentralConnectionStatus {
    /// Current phase of the connection
    #[serde(default)]
    pub phase: ConnectionPhase,

    /// Validity window of the stored client certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_status: Option<CertificateStatus>,

    /// Synchronization timestamps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization_status: Option<SynchronizationStatus>,

    /// Management info URL learned at handshake
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_info_url: Option<String>,

    /// Error of the last failed reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StatusError>,
}

impl CentralConnectionStatus {
    /// When the last synchronization was attempted
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.synchronization_status
            .as_ref()
            .and_then(SynchronizationStatus::last_sync_time)
    }
}

impl CentralConnection {
    /// Management info URL, preferring the spec override over the learned one
    pub fn management_info_url(&self) -> Option<&str> {
        self.spec
            .management_info_url
            .as_deref()
            .or_else(|| {
                self.status
                    .as_ref()
                    .and_then(|s| s.management_info_url.as_deref())
            })
            .filter(|url| !url.is_empty())
    }
}

/// Format a timestamp the way status fields store it
pub fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
