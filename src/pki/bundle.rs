//! Certificates issued by the connector

use base64::prelude::*;
use zeroize::Zeroizing;

use super::{PkiError, Result};

/// Decoded certificates from a CSR or renewal response
#[derive(Clone)]
pub struct CertificateBundle {
    /// PEM client certificate followed by its issuing chain
    pub chain: Vec<u8>,
    /// PEM client certificate alone
    pub client_crt: Vec<u8>,
    /// PEM connector CA certificate
    pub ca_crt: Vec<u8>,
    /// PEM private key behind `client_crt`, set when the key was rotated
    pub client_key: Option<Zeroizing<String>>,
}

impl CertificateBundle {
    /// Decode the three base64 fields of a certificates response
    ///
    /// Either all three decode or the response is rejected.
    pub fn decode(crt: &str, client_crt: &str, ca_crt: &str) -> Result<Self> {
        Ok(Self {
            chain: decode_field("crt", crt)?,
            client_crt: decode_field("clientCrt", client_crt)?,
            ca_crt: decode_field("caCrt", ca_crt)?,
            client_key: None,
        })
    }

    /// Attach the private key matching the client certificate
    pub fn with_client_key(mut self, key_pem: Zeroizing<String>) -> Self {
        self.client_key = Some(key_pem);
        self
    }
}

impl std::fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("chain_len", &self.chain.len())
            .field("client_crt_len", &self.client_crt.len())
            .field("ca_crt_len", &self.ca_crt.len())
            .field("has_client_key", &self.client_key.is_some())
            .finish()
    }
}

fn decode_field(field: &'static str, value: &str) -> Result<Vec<u8>> {
    BASE64_STANDARD
        .decode(value.trim())
        .map_err(|e| PkiError::Decode {
            field,
            message: e.to_string(),
        })
}
