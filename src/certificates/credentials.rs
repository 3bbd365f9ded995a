//! Reading the current credential set from the store

use async_trait::async_trait;
use tracing::debug;
use zeroize::Zeroizing;

#[cfg(test)]
use mockall::automock;

use crate::config::CertificateConfig;
use crate::connector::ClientCredentials;
use crate::secrets::{SecretData, SecretName, SecretRepository, StoreError};
use crate::{Error, Result, CA_CERTIFICATE_KEY, CERTIFICATE_KEY, PRIVATE_KEY_KEY};

/// Access to the credentials the agent currently holds
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    /// Whether a client certificate and CA certificate are stored
    async fn credentials_exist(&self) -> Result<bool>;

    /// Load key, certificate chain and CA certificate
    async fn get_client_credentials(&self) -> Result<ClientCredentials>;
}

/// [`CredentialsProvider`] over a [`SecretRepository`]
pub struct SecretCredentialsProvider {
    secrets: SecretRepository,
    csr_key_secret: SecretName,
    client_cert_secret: SecretName,
    ca_cert_secret: SecretName,
}

impl SecretCredentialsProvider {
    /// Create a provider reading the records named in `config`
    pub fn new(secrets: SecretRepository, config: &CertificateConfig) -> Self {
        Self {
            secrets,
            csr_key_secret: config.csr_key_secret.clone(),
            client_cert_secret: config.client_cert_secret.clone(),
            ca_cert_secret: config.ca_cert_secret.clone(),
        }
    }

    async fn optional(&self, name: &SecretName) -> Result<Option<SecretData>> {
        match self.secrets.get(name).await {
            Ok(data) => Ok(Some(data)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Client key, preferring the client record over the key-only record
    async fn client_key(&self, client: &SecretData) -> Result<Zeroizing<String>> {
        if let Some(key) = non_empty(client, PRIVATE_KEY_KEY) {
            return Ok(Zeroizing::new(key));
        }

        debug!(secret = %self.csr_key_secret, "client record has no key, using CSR key");
        self.optional(&self.csr_key_secret)
            .await?
            .and_then(|data| non_empty(&data, PRIVATE_KEY_KEY))
            .map(Zeroizing::new)
            .ok_or_else(|| {
                Error::IncompleteCredentials(format!(
                    "no private key in {} or {}",
                    self.client_cert_secret, self.csr_key_secret
                ))
            })
    }
}

#[async_trait]
impl CredentialsProvider for SecretCredentialsProvider {
    async fn credentials_exist(&self) -> Result<bool> {
        let Some(client) = self.optional(&self.client_cert_secret).await? else {
            return Ok(false);
        };
        if non_empty(&client, CERTIFICATE_KEY).is_none() {
            return Ok(false);
        }

        Ok(self
            .optional(&self.ca_cert_secret)
            .await?
            .is_some_and(|ca| non_empty(&ca, CA_CERTIFICATE_KEY).is_some()))
    }

    async fn get_client_credentials(&self) -> Result<ClientCredentials> {
        let client = self.secrets.get(&self.client_cert_secret).await?;
        let certificate_chain = non_empty(&client, CERTIFICATE_KEY).ok_or_else(|| {
            Error::IncompleteCredentials(format!(
                "{} has no {}",
                self.client_cert_secret, CERTIFICATE_KEY
            ))
        })?;
        let client_key = self.client_key(&client).await?;

        let ca = self.secrets.get(&self.ca_cert_secret).await?;
        let ca_certificate = non_empty(&ca, CA_CERTIFICATE_KEY).ok_or_else(|| {
            Error::IncompleteCredentials(format!(
                "{} has no {}",
                self.ca_cert_secret, CA_CERTIFICATE_KEY
            ))
        })?;

        Ok(ClientCredentials {
            client_key,
            certificate_chain,
            ca_certificate,
        })
    }
}

fn non_empty(data: &SecretData, key: &str) -> Option<String> {
    data.get(key)
        .filter(|value| !value.is_empty())
        .map(|value| String::from_utf8_lossy(value).into_owned())
}
