//! Fake connector and component wiring shared by the lifecycle stories

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::prelude::*;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::RsaPrivateKey;
use tokio::net::TcpListener;
use x509_parser::prelude::*;

use tether::certificates::{SecretCredentialsProvider, SecretPreserver};
use tether::config::CertificateConfig;
use tether::connector::HttpHandshakeClient;
use tether::pki::{parse_pem, CsrProvider, RsaCsrProvider};
use tether::secrets::{MemorySecretStore, SecretRepository};

/// Subject the fake connector asks agents to use
pub const SUBJECT: &str = "CN=ec-default,O=Organization,OU=OrgUnit,L=Waldorf,ST=Waldorf,C=DE";

/// Keys small enough to keep the stories fast
const TEST_KEY_BITS: usize = 2048;

// =============================================================================
// Fake connector
// =============================================================================

struct ConnectorState {
    base_url: String,
    ca_key: KeyPair,
    ca_pem: String,
    received_csrs: Mutex<Vec<String>>,
}

/// Handle on a running fake connector
#[derive(Clone)]
pub struct FakeConnector {
    state: Arc<ConnectorState>,
}

impl FakeConnector {
    /// Start a connector on an ephemeral local port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Fake Connector CA");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let ca_key = KeyPair::generate().unwrap();
        let ca_pem = params.self_signed(&ca_key).unwrap().pem();

        let state = Arc::new(ConnectorState {
            base_url,
            ca_key,
            ca_pem,
            received_csrs: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/v1/applications/signingRequests/info", get(csr_info))
            .route("/v1/applications/certificates", post(sign))
            .route("/v1/applications/management/info", get(management_info))
            .route("/v1/applications/certificates/renewals", post(sign))
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { state }
    }

    /// One-time URL handed to the agent out of band
    pub fn csr_info_url(&self) -> String {
        format!(
            "{}/v1/applications/signingRequests/info?token=abc",
            self.state.base_url
        )
    }

    pub fn management_info_url(&self) -> String {
        format!("{}/v1/applications/management/info", self.state.base_url)
    }

    pub fn renewal_url(&self) -> String {
        format!("{}/v1/applications/certificates/renewals", self.state.base_url)
    }

    pub fn ca_pem(&self) -> &str {
        &self.state.ca_pem
    }

    /// CSRs received so far, base64 encoded as submitted
    pub fn received_csrs(&self) -> Vec<String> {
        self.state.received_csrs.lock().unwrap().clone()
    }
}

async fn csr_info(State(state): State<Arc<ConnectorState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "csrUrl": format!("{}/v1/applications/certificates?token=abc", state.base_url),
        "api": {
            "infoUrl": format!("{}/v1/applications/management/info", state.base_url),
        },
        "certificate": {
            "subject": SUBJECT,
            "extensions": "",
            "key-algorithm": "rsa2048",
        },
    }))
}

async fn management_info(State(state): State<Arc<ConnectorState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "clientIdentity": {"application": "ec-default", "tenant": "t1", "group": "g1"},
        "urls": {
            "renewCertUrl": format!("{}/v1/applications/certificates/renewals", state.base_url),
        },
    }))
}

async fn sign(
    State(state): State<Arc<ConnectorState>>,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    let csr = body["csr"].as_str().unwrap_or_default().to_string();
    state.received_csrs.lock().unwrap().push(csr.clone());

    let csr_pem = String::from_utf8(BASE64_STANDARD.decode(csr).unwrap()).unwrap();
    let mut request = CertificateSigningRequestParams::from_pem(&csr_pem).unwrap();
    let now = ::time::OffsetDateTime::now_utc();
    request.params.not_before = now;
    request.params.not_after = now + ::time::Duration::days(90);
    let issuer = Issuer::from_ca_cert_pem(&state.ca_pem, &state.ca_key).unwrap();
    let client_crt = request.signed_by(&issuer).unwrap().pem();
    let chain = format!("{}{}", client_crt, state.ca_pem);

    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "crt": BASE64_STANDARD.encode(chain),
            "clientCrt": BASE64_STANDARD.encode(client_crt),
            "caCrt": BASE64_STANDARD.encode(&state.ca_pem),
        })),
    )
}

// =============================================================================
// Agent side wiring
// =============================================================================

/// The agent's lifecycle components sharing one in-memory store
pub struct Agent {
    pub config: CertificateConfig,
    pub secrets: SecretRepository,
    pub csr_provider: Arc<dyn CsrProvider>,
    pub handshake: HttpHandshakeClient,
    pub preserver: SecretPreserver,
    pub credentials: SecretCredentialsProvider,
}

impl Agent {
    pub fn new() -> Self {
        let config = CertificateConfig {
            rsa_key_bits: TEST_KEY_BITS,
            ..Default::default()
        };
        let secrets = SecretRepository::new(Arc::new(MemorySecretStore::new()));
        let csr_provider: Arc<dyn CsrProvider> =
            Arc::new(RsaCsrProvider::new(secrets.clone(), &config));
        let handshake =
            HttpHandshakeClient::new(csr_provider.clone(), Duration::from_secs(10)).unwrap();

        Self {
            preserver: SecretPreserver::new(secrets.clone(), &config),
            credentials: SecretCredentialsProvider::new(secrets.clone(), &config),
            config,
            secrets,
            csr_provider,
            handshake,
        }
    }
}

// =============================================================================
// Key material helpers
// =============================================================================

/// DER SubjectPublicKeyInfo of a PKCS#8 PEM private key
pub fn public_key_of(key_pem: &str) -> Vec<u8> {
    let key = RsaPrivateKey::from_pkcs8_pem(key_pem).unwrap();
    key.to_public_key()
        .to_public_key_der()
        .unwrap()
        .as_bytes()
        .to_vec()
}

/// DER SubjectPublicKeyInfo of the leaf certificate in a PEM chain
pub fn public_key_of_certificate(chain_pem: &str) -> Vec<u8> {
    let der = parse_pem(chain_pem).unwrap();
    let (_, cert) = X509Certificate::from_der(&der).unwrap();
    cert.public_key().raw.to_vec()
}
