//! First-time connection to the central connector
//!
//! The handshake is unauthenticated: the CSR-info URL carries a one-time
//! token and the connector signs whatever CSR arrives for it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use super::{read_response, CertificatesResponse, ConnectorError, CsrInfoResponse, CsrRequest};
use crate::pki::{CertificateBundle, CsrProvider, Subject};

/// Result of a successful handshake
#[derive(Clone, Debug)]
pub struct EstablishedConnection {
    /// Issued certificates, with the key the CSR was signed with
    pub bundle: CertificateBundle,
    /// Management info endpoint announced by the connector
    pub management_info_url: String,
}

/// Runs the CSR-info / CSR-submit handshake
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HandshakeClient: Send + Sync {
    /// Obtain the first certificate for the connection behind `csr_info_url`
    ///
    /// No step is retried; the error names the step that failed.
    async fn establish(&self, csr_info_url: &str)
        -> Result<EstablishedConnection, ConnectorError>;
}

/// [`HandshakeClient`] over plain HTTPS
pub struct HttpHandshakeClient {
    http: reqwest::Client,
    csr_provider: Arc<dyn CsrProvider>,
}

impl HttpHandshakeClient {
    /// Create a handshake client whose requests time out after `request_timeout`
    pub fn new(
        csr_provider: Arc<dyn CsrProvider>,
        request_timeout: Duration,
    ) -> Result<Self, ConnectorError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ConnectorError::Tls(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, csr_provider })
    }

    async fn fetch_csr_info(&self, url: &str) -> Result<CsrInfoResponse, ConnectorError> {
        let response = self.http.get(url).send().await?;
        read_response(response, StatusCode::OK).await
    }

    async fn submit_csr(
        &self,
        url: &str,
        csr: String,
    ) -> Result<CertificatesResponse, ConnectorError> {
        let response = self.http.post(url).json(&CsrRequest { csr }).send().await?;
        read_response(response, StatusCode::CREATED).await
    }
}

#[async_trait]
impl HandshakeClient for HttpHandshakeClient {
    async fn establish(
        &self,
        csr_info_url: &str,
    ) -> Result<EstablishedConnection, ConnectorError> {
        info!(url = %csr_info_url, "fetching CSR info");
        let info = self
            .fetch_csr_info(csr_info_url)
            .await
            .map_err(|e| ConnectorError::step("fetch CSR info", e))?;

        let subject = Subject::parse(&info.certificate.subject);
        debug!(%subject, "connector requested subject");

        let request = self
            .csr_provider
            .create_csr(&subject)
            .await
            .map_err(|e| ConnectorError::step("build CSR", e))?;

        info!(url = %info.csr_url, "submitting CSR");
        let response = self
            .submit_csr(&info.csr_url, request.csr)
            .await
            .map_err(|e| ConnectorError::step("submit CSR", e))?;

        let bundle = response
            .into_bundle()
            .map_err(|e| ConnectorError::step("decode certificates", e))?
            .with_client_key(request.key_pem);

        info!(management_info_url = %info.api.info_url, "certificate issued by connector");
        Ok(EstablishedConnection {
            bundle,
            management_info_url: info.api.info_url,
        })
    }
}
