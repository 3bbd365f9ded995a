//! Mutually authenticated connection to the central connector
//!
//! Once the agent holds a certificate it authenticates with it for every
//! call. A client is bound to the credentials it was built from; after a
//! renewal the caller builds a new one from the preserved credentials.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, info};
use zeroize::Zeroizing;

#[cfg(test)]
use mockall::automock;

use super::{read_response, CertificatesResponse, ConnectorError, CsrRequest, ManagementInfo};
use crate::pki::{CertificateBundle, CertificateInfo, CsrProvider, PkiError, Subject};

/// Credentials currently stored for the agent
#[derive(Clone)]
pub struct ClientCredentials {
    /// PEM private key of the client certificate
    pub client_key: Zeroizing<String>,
    /// PEM client certificate followed by its chain
    pub certificate_chain: String,
    /// PEM connector CA certificate
    pub ca_certificate: String,
}

impl ClientCredentials {
    /// Validity window and subject of the client certificate
    pub fn certificate_info(&self) -> Result<CertificateInfo, PkiError> {
        CertificateInfo::from_pem(&self.certificate_chain)
    }
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_key", &"<redacted>")
            .field("certificate_chain", &self.certificate_chain)
            .field("ca_certificate", &self.ca_certificate)
            .finish()
    }
}

/// Calls available over an established connection
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EstablishedConnectionClient: Send + Sync {
    /// Fetch management info; anything but 200 is an error
    async fn management_info(&self, url: &str) -> Result<ManagementInfo, ConnectorError>;

    /// Renew the client certificate with a fresh key
    ///
    /// The returned bundle carries the new key in `client_key`.
    async fn renew_certificate(
        &self,
        renewal_url: &str,
    ) -> Result<CertificateBundle, ConnectorError>;
}

/// Builds [`EstablishedConnectionClient`]s from stored credentials
#[cfg_attr(test, automock)]
pub trait ClientProvider: Send + Sync {
    /// Client authenticating with `credentials`
    fn create_client(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<Arc<dyn EstablishedConnectionClient>, ConnectorError>;
}

/// [`EstablishedConnectionClient`] over reqwest with a client identity
pub struct MtlsClient {
    http: reqwest::Client,
    csr_provider: Arc<dyn CsrProvider>,
    subject: Subject,
}

impl MtlsClient {
    /// Wrap an already configured HTTP client
    ///
    /// Renewal CSRs are requested for `subject`.
    pub fn new(http: reqwest::Client, csr_provider: Arc<dyn CsrProvider>, subject: Subject) -> Self {
        Self {
            http,
            csr_provider,
            subject,
        }
    }
}

#[async_trait]
impl EstablishedConnectionClient for MtlsClient {
    async fn management_info(&self, url: &str) -> Result<ManagementInfo, ConnectorError> {
        debug!(url = %url, "fetching management info");
        let response = self.http.get(url).send().await?;
        read_response(response, StatusCode::OK).await
    }

    async fn renew_certificate(
        &self,
        renewal_url: &str,
    ) -> Result<CertificateBundle, ConnectorError> {
        let request = self
            .csr_provider
            .renewal_csr(&self.subject)
            .await
            .map_err(|e| ConnectorError::step("build CSR", e))?;

        info!(url = %renewal_url, subject = %self.subject, "requesting certificate renewal");
        let response = self
            .http
            .post(renewal_url)
            .json(&CsrRequest { csr: request.csr })
            .send()
            .await
            .map_err(|e| ConnectorError::step("submit renewal", e))?;
        let certificates: CertificatesResponse = read_response(response, StatusCode::CREATED)
            .await
            .map_err(|e| ConnectorError::step("submit renewal", e))?;

        let bundle = certificates
            .into_bundle()
            .map_err(|e| ConnectorError::step("decode certificates", e))?
            .with_client_key(request.key_pem);

        info!("certificate renewed");
        Ok(bundle)
    }
}

/// [`ClientProvider`] building rustls mTLS clients
pub struct MtlsClientProvider {
    csr_provider: Arc<dyn CsrProvider>,
    request_timeout: Duration,
}

impl MtlsClientProvider {
    /// Create a provider whose clients time out after `request_timeout`
    pub fn new(csr_provider: Arc<dyn CsrProvider>, request_timeout: Duration) -> Self {
        Self {
            csr_provider,
            request_timeout,
        }
    }
}

impl ClientProvider for MtlsClientProvider {
    fn create_client(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<Arc<dyn EstablishedConnectionClient>, ConnectorError> {
        let mut identity_pem = Zeroizing::new(Vec::new());
        identity_pem.extend_from_slice(credentials.client_key.as_bytes());
        identity_pem.push(b'\n');
        identity_pem.extend_from_slice(credentials.certificate_chain.as_bytes());

        let identity = reqwest::Identity::from_pem(&identity_pem)
            .map_err(|e| ConnectorError::Tls(format!("invalid client identity: {}", e)))?;
        let ca = reqwest::Certificate::from_pem(credentials.ca_certificate.as_bytes())
            .map_err(|e| ConnectorError::Tls(format!("invalid CA certificate: {}", e)))?;

        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .add_root_certificate(ca)
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| ConnectorError::Tls(format!("failed to build HTTP client: {}", e)))?;

        let subject = credentials.certificate_info()?.subject;
        Ok(Arc::new(MtlsClient::new(
            http,
            self.csr_provider.clone(),
            subject,
        )))
    }
}
