//! Central connector HTTP protocol
//!
//! Two clients talk to the connector:
//!
//! - [`handshake`] - the unauthenticated CSR-info / CSR-submit exchange that
//!   bootstraps the first certificate
//! - [`established`] - the mTLS client for management info and renewals
//!
//! Both share the wire types and error-body handling defined here.

pub mod established;
pub mod handshake;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pki::{CertificateBundle, PkiError};

pub use established::{
    ClientCredentials, ClientProvider, EstablishedConnectionClient, MtlsClient,
    MtlsClientProvider,
};
pub use handshake::{EstablishedConnection, HandshakeClient, HttpHandshakeClient};

/// Connector communication errors
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The request did not produce a response
    #[error("request failed: {0}")]
    Transport(String),

    /// The connector answered with an unexpected status
    #[error("unexpected status {status}: {message}")]
    Protocol {
        /// HTTP status code
        status: u16,
        /// Error reported by the connector, or the dumped response
        message: String,
    },

    /// A success response body did not have the expected shape
    #[error("invalid response body: {0}")]
    InvalidBody(String),

    /// Key, CSR or certificate handling failed
    #[error(transparent)]
    Pki(#[from] PkiError),

    /// The mTLS client could not be built from the stored credentials
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// A named protocol step failed
    #[error("{step}: {source}")]
    Step {
        /// Step that failed
        step: &'static str,
        /// Underlying error
        #[source]
        source: Box<ConnectorError>,
    },
}

impl ConnectorError {
    /// Create a protocol error for an unexpected status
    pub fn protocol(status: u16, message: impl Into<String>) -> Self {
        Self::Protocol {
            status,
            message: message.into(),
        }
    }

    /// Wrap an error with the name of the protocol step it came from
    pub fn step(step: &'static str, source: impl Into<ConnectorError>) -> Self {
        Self::Step {
            step,
            source: Box::new(source.into()),
        }
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Response of the CSR-info endpoint
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrInfoResponse {
    /// Where to submit the CSR
    pub csr_url: String,
    /// API endpoints available once connected
    pub api: CsrInfoApi,
    /// Certificate the agent must request
    pub certificate: CsrInfoCertificate,
}

/// API section of [`CsrInfoResponse`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrInfoApi {
    /// Management info endpoint for the established connection
    pub info_url: String,
}

/// Certificate section of [`CsrInfoResponse`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrInfoCertificate {
    /// Subject string, e.g. `CN=agent,O=Org,C=DE`
    pub subject: String,
}

/// Body of CSR submission and renewal requests
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CsrRequest {
    /// Base64 of the PEM encoded CSR
    pub csr: String,
}

/// Body of CSR submission and renewal responses, all fields base64 PEM
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificatesResponse {
    /// Client certificate with its chain
    pub crt: String,
    /// Client certificate alone
    pub client_crt: String,
    /// Connector CA certificate
    pub ca_crt: String,
}

impl CertificatesResponse {
    /// Decode into a [`CertificateBundle`]
    pub fn into_bundle(self) -> Result<CertificateBundle, PkiError> {
        CertificateBundle::decode(&self.crt, &self.client_crt, &self.ca_crt)
    }
}

/// Management info served over the established connection
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagementInfo {
    /// Who the connector thinks this agent is
    #[serde(default)]
    pub client_identity: ClientIdentity,
    /// Endpoints for the established connection
    #[serde(default)]
    pub urls: ManagementUrls,
}

/// Identity section of [`ManagementInfo`]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIdentity {
    /// Application name
    #[serde(default)]
    pub application: String,
    /// Tenant
    #[serde(default)]
    pub tenant: String,
    /// Group
    #[serde(default)]
    pub group: String,
}

/// URL section of [`ManagementInfo`]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagementUrls {
    /// Certificate renewal endpoint
    #[serde(default)]
    pub renew_cert_url: String,
    /// Certificate revocation endpoint
    #[serde(default)]
    pub revocation_cert_url: String,
    /// Events endpoint
    #[serde(default)]
    pub events_url: String,
    /// Metadata endpoint
    #[serde(default)]
    pub metadata_url: String,
}

/// Error body returned by the connector on failures
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP-like error code
    pub code: i32,
    /// Error description
    pub error: String,
}

/// Check the status of a response and parse its JSON body
///
/// Any other status becomes a [`ConnectorError::Protocol`] carrying either
/// the connector's `{code, error}` body or, when the body has a different
/// shape, the status, headers and raw body.
pub(crate) async fn read_response<T: DeserializeOwned>(
    response: reqwest::Response,
    expected: StatusCode,
) -> Result<T, ConnectorError> {
    if response.status() != expected {
        return Err(error_from_response(response).await);
    }

    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| ConnectorError::InvalidBody(e.to_string()))
}

async fn error_from_response(response: reqwest::Response) -> ConnectorError {
    let status = response.status();
    let headers = format!("{:?}", response.headers());
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => format!("<unreadable body: {}>", e),
    };

    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) => ConnectorError::protocol(
            status.as_u16(),
            format!("connector error {}: {}", err.code, err.error),
        ),
        Err(_) => ConnectorError::protocol(
            status.as_u16(),
            format!("status: {}, headers: {}, body: {}", status, headers, body),
        ),
    }
}
