//! Runtime configuration
//!
//! Both structs default to the constants in the crate root; `main` fills
//! them from CLI flags and `TETHER_*` environment variables.

use std::time::Duration;

use crate::retry::RetryConfig;
use crate::secrets::SecretName;
use crate::{
    DEFAULT_CA_CERT_SECRET, DEFAULT_CLIENT_CERT_SECRET, DEFAULT_CSR_KEY_SECRET,
    DEFAULT_MINIMAL_SYNC_PERIOD_SECS, DEFAULT_RENEWAL_THRESHOLD, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_RSA_KEY_BITS, DEFAULT_SECRETS_NAMESPACE, DEFAULT_STEP_TIMEOUT_SECS,
};

/// Where key material lives and how keys are generated
#[derive(Clone, Debug)]
pub struct CertificateConfig {
    /// RSA modulus size for generated keys
    pub rsa_key_bits: usize,
    /// Key-only record used for the initial CSR
    pub csr_key_secret: SecretName,
    /// Record holding `crt` (chain) and `key`
    pub client_cert_secret: SecretName,
    /// Record holding `ca.crt`
    pub ca_cert_secret: SecretName,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self::in_namespace(DEFAULT_SECRETS_NAMESPACE)
    }
}

impl CertificateConfig {
    /// Default record names in the given namespace
    pub fn in_namespace(namespace: &str) -> Self {
        Self {
            rsa_key_bits: DEFAULT_RSA_KEY_BITS,
            csr_key_secret: SecretName::new(namespace, DEFAULT_CSR_KEY_SECRET),
            client_cert_secret: SecretName::new(namespace, DEFAULT_CLIENT_CERT_SECRET),
            ca_cert_secret: SecretName::new(namespace, DEFAULT_CA_CERT_SECRET),
        }
    }
}

/// Timing of the connection control loop
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Minimal interval between synchronizations, also the requeue interval
    pub minimal_sync_period: Duration,
    /// Renew once less than this fraction of the validity window remains
    pub renewal_threshold: f64,
    /// Timeout for a single HTTP request to the connector
    pub request_timeout: Duration,
    /// Timeout for a single reconcile stage
    pub step_timeout: Duration,
    /// Backoff for status writes that hit a conflict
    pub status_retry: RetryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            minimal_sync_period: Duration::from_secs(DEFAULT_MINIMAL_SYNC_PERIOD_SECS),
            renewal_threshold: DEFAULT_RENEWAL_THRESHOLD,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
            status_retry: RetryConfig::conflict(),
        }
    }
}

impl ControllerConfig {
    /// Reject settings the control loop cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        if !(self.renewal_threshold > 0.0 && self.renewal_threshold < 1.0) {
            return Err(crate::Error::validation(format!(
                "renewal threshold must be between 0 and 1, got {}",
                self.renewal_threshold
            )));
        }
        if self.minimal_sync_period.is_zero() {
            return Err(crate::Error::validation(
                "minimal sync period must be greater than zero",
            ));
        }
        if self.step_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(crate::Error::validation("timeouts must be greater than zero"));
        }
        Ok(())
    }
}
