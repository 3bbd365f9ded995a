//! Writing issued certificates to the credential store

use async_trait::async_trait;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::config::CertificateConfig;
use crate::pki::CertificateBundle;
use crate::secrets::{SecretData, SecretName, SecretRepository};
use crate::{Result, CA_CERTIFICATE_KEY, CERTIFICATE_KEY, PRIVATE_KEY_KEY};

/// Stores a freshly issued [`CertificateBundle`]
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Preserver: Send + Sync {
    /// Merge the bundle into the client and CA records
    ///
    /// The two writes are not atomic. If the CA write fails the client
    /// record already holds the new certificate and the error is returned;
    /// the caller retries the whole issuance.
    async fn preserve_certificates(&self, bundle: &CertificateBundle) -> Result<()>;
}

/// [`Preserver`] over a [`SecretRepository`]
pub struct SecretPreserver {
    secrets: SecretRepository,
    client_cert_secret: SecretName,
    ca_cert_secret: SecretName,
}

impl SecretPreserver {
    /// Create a preserver writing to the records named in `config`
    pub fn new(secrets: SecretRepository, config: &CertificateConfig) -> Self {
        Self {
            secrets,
            client_cert_secret: config.client_cert_secret.clone(),
            ca_cert_secret: config.ca_cert_secret.clone(),
        }
    }
}

#[async_trait]
impl Preserver for SecretPreserver {
    async fn preserve_certificates(&self, bundle: &CertificateBundle) -> Result<()> {
        let mut client = SecretData::new();
        client.insert(CERTIFICATE_KEY.to_string(), bundle.chain.clone());
        if let Some(key) = &bundle.client_key {
            client.insert(PRIVATE_KEY_KEY.to_string(), key.as_bytes().to_vec());
        }
        self.secrets
            .upsert_with_merge(&self.client_cert_secret, client)
            .await?;
        debug!(secret = %self.client_cert_secret, "stored client certificate");

        let mut ca = SecretData::new();
        ca.insert(CA_CERTIFICATE_KEY.to_string(), bundle.ca_crt.clone());
        self.secrets
            .upsert_with_merge(&self.ca_cert_secret, ca)
            .await?;

        info!(
            client_secret = %self.client_cert_secret,
            ca_secret = %self.ca_cert_secret,
            "preserved certificates"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::{
        CredentialRecord, MemorySecretStore, SecretStore, StoreError,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use zeroize::Zeroizing;

    /// Store failing the first `failures` writes to one record
    struct FailingWrites {
        inner: MemorySecretStore,
        target: SecretName,
        failures: AtomicU32,
    }

    impl FailingWrites {
        fn new(target: SecretName, failures: u32) -> Self {
            Self {
                inner: MemorySecretStore::new(),
                target,
                failures: AtomicU32::new(failures),
            }
        }

        fn should_fail(&self, name: &SecretName) -> bool {
            name == &self.target
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
        }
    }

    #[async_trait]
    impl SecretStore for FailingWrites {
        async fn get(&self, name: &SecretName) -> std::result::Result<CredentialRecord, StoreError> {
            self.inner.get(name).await
        }

        async fn create(&self, record: &CredentialRecord) -> std::result::Result<(), StoreError> {
            if self.should_fail(&record.name) {
                return Err(StoreError::backend(&record.name, "etcd unavailable"));
            }
            self.inner.create(record).await
        }

        async fn update(&self, record: &CredentialRecord) -> std::result::Result<(), StoreError> {
            if self.should_fail(&record.name) {
                return Err(StoreError::backend(&record.name, "etcd unavailable"));
            }
            self.inner.update(record).await
        }

        async fn delete(&self, name: &SecretName) -> std::result::Result<(), StoreError> {
            self.inner.delete(name).await
        }
    }

    fn bundle(chain: &str, ca: &str, key: Option<&str>) -> CertificateBundle {
        let bundle = CertificateBundle {
            chain: chain.as_bytes().to_vec(),
            client_crt: b"client".to_vec(),
            ca_crt: ca.as_bytes().to_vec(),
            client_key: None,
        };
        match key {
            Some(key) => bundle.with_client_key(Zeroizing::new(key.to_string())),
            None => bundle,
        }
    }

    fn field(data: &SecretData, key: &str) -> Option<String> {
        data.get(key).map(|v| String::from_utf8_lossy(v).into_owned())
    }

    #[tokio::test]
    async fn writes_chain_key_and_ca() {
        let config = CertificateConfig::default();
        let secrets = SecretRepository::new(Arc::new(MemorySecretStore::new()));
        let preserver = SecretPreserver::new(secrets.clone(), &config);

        preserver
            .preserve_certificates(&bundle("chain", "ca", Some("key")))
            .await
            .unwrap();

        let client = secrets.get(&config.client_cert_secret).await.unwrap();
        assert_eq!(field(&client, CERTIFICATE_KEY).as_deref(), Some("chain"));
        assert_eq!(field(&client, PRIVATE_KEY_KEY).as_deref(), Some("key"));
        let ca = secrets.get(&config.ca_cert_secret).await.unwrap();
        assert_eq!(field(&ca, CA_CERTIFICATE_KEY).as_deref(), Some("ca"));
    }

    #[tokio::test]
    async fn merge_keeps_existing_key_when_bundle_has_none() {
        let config = CertificateConfig::default();
        let secrets = SecretRepository::new(Arc::new(MemorySecretStore::new()));
        let preserver = SecretPreserver::new(secrets.clone(), &config);

        preserver
            .preserve_certificates(&bundle("old-chain", "ca", Some("old-key")))
            .await
            .unwrap();
        preserver
            .preserve_certificates(&bundle("new-chain", "ca", None))
            .await
            .unwrap();

        let client = secrets.get(&config.client_cert_secret).await.unwrap();
        assert_eq!(field(&client, CERTIFICATE_KEY).as_deref(), Some("new-chain"));
        assert_eq!(field(&client, PRIVATE_KEY_KEY).as_deref(), Some("old-key"));
    }

    /// A failed CA write leaves the new client certificate in place; the
    /// next attempt completes both records.
    #[tokio::test]
    async fn failed_ca_write_is_reported_and_retry_completes() {
        let config = CertificateConfig::default();
        let store = Arc::new(FailingWrites::new(config.ca_cert_secret.clone(), 1));
        let secrets = SecretRepository::new(store);
        let preserver = SecretPreserver::new(secrets.clone(), &config);
        let issued = bundle("new-chain", "new-ca", Some("new-key"));

        let err = preserver.preserve_certificates(&issued).await.unwrap_err();
        assert!(err.to_string().contains("etcd unavailable"));

        let client = secrets.get(&config.client_cert_secret).await.unwrap();
        assert_eq!(field(&client, CERTIFICATE_KEY).as_deref(), Some("new-chain"));
        assert!(matches!(
            secrets.get(&config.ca_cert_secret).await,
            Err(StoreError::NotFound(_))
        ));

        preserver.preserve_certificates(&issued).await.unwrap();
        let ca = secrets.get(&config.ca_cert_secret).await.unwrap();
        assert_eq!(field(&ca, CA_CERTIFICATE_KEY).as_deref(), Some("new-ca"));
    }

    #[tokio::test]
    async fn failed_client_write_skips_ca() {
        let config = CertificateConfig::default();
        let store = Arc::new(FailingWrites::new(config.client_cert_secret.clone(), 1));
        let secrets = SecretRepository::new(store);
        let preserver = SecretPreserver::new(secrets.clone(), &config);

        assert!(preserver
            .preserve_certificates(&bundle("chain", "ca", None))
            .await
            .is_err());
        assert!(secrets.get(&config.ca_cert_secret).await.is_err());
    }
}
