//! Certificate lifecycle stories
//!
//! An agent receives a one-time CSR info URL, trades a CSR for its first
//! client certificate, stores it, and later rotates key and certificate
//! through the management API it learned during the handshake.

use std::sync::Arc;
use std::time::Duration;

use tether::certificates::{CredentialsProvider, Preserver};
use tether::connector::{
    ClientProvider, EstablishedConnectionClient, HandshakeClient, MtlsClient, MtlsClientProvider,
};
use tether::pki::Subject;
use tether::PRIVATE_KEY_KEY;

use super::fixtures::{public_key_of, public_key_of_certificate, Agent, FakeConnector, SUBJECT};

// =============================================================================
// First connection
// =============================================================================

/// Story: A fresh agent connects and ends up with usable stored credentials
///
/// Nothing is stored before the handshake. Afterwards the client record holds
/// the chain and the CSR key, the CA record holds the connector CA, and the
/// issued certificate carries the subject the connector asked for.
#[tokio::test]
async fn story_first_handshake_issues_and_stores_credentials() {
    let connector = FakeConnector::start().await;
    let agent = Agent::new();

    assert!(!agent.credentials.credentials_exist().await.unwrap());

    let established = agent
        .handshake
        .establish(&connector.csr_info_url())
        .await
        .unwrap();
    assert_eq!(
        established.management_info_url,
        connector.management_info_url()
    );

    agent
        .preserver
        .preserve_certificates(&established.bundle)
        .await
        .unwrap();

    assert!(agent.credentials.credentials_exist().await.unwrap());
    let credentials = agent.credentials.get_client_credentials().await.unwrap();

    assert_eq!(credentials.ca_certificate, connector.ca_pem());
    assert!(credentials.certificate_chain.ends_with(connector.ca_pem()));
    assert_eq!(
        public_key_of(&credentials.client_key),
        public_key_of_certificate(&credentials.certificate_chain)
    );

    let info = credentials.certificate_info().unwrap();
    assert_eq!(info.subject, Subject::parse(SUBJECT));
    assert!(info.not_after > info.not_before);
}

/// Story: A handshake interrupted before preservation is repeated with the same key
///
/// The CSR key is persisted before the CSR is sent, so the retried handshake
/// submits an identical request and the connector sees no new identity.
#[tokio::test]
async fn story_retried_handshake_reuses_the_stored_key() {
    let connector = FakeConnector::start().await;
    let agent = Agent::new();

    let first = agent
        .handshake
        .establish(&connector.csr_info_url())
        .await
        .unwrap();
    let second = agent
        .handshake
        .establish(&connector.csr_info_url())
        .await
        .unwrap();

    let csrs = connector.received_csrs();
    assert_eq!(csrs.len(), 2);
    assert_eq!(csrs[0], csrs[1]);
    assert_eq!(first.bundle.client_key, second.bundle.client_key);

    let stored = agent.secrets.get(&agent.config.csr_key_secret).await.unwrap();
    let stored_key = String::from_utf8(stored[PRIVATE_KEY_KEY].clone()).unwrap();
    assert_eq!(
        Some(stored_key.as_str()),
        first.bundle.client_key.as_deref().map(String::as_str)
    );
}

/// Story: Stored credentials are accepted by the mutual TLS client
#[tokio::test]
async fn story_issued_credentials_build_an_mtls_client() {
    let connector = FakeConnector::start().await;
    let agent = Agent::new();

    let established = agent
        .handshake
        .establish(&connector.csr_info_url())
        .await
        .unwrap();
    agent
        .preserver
        .preserve_certificates(&established.bundle)
        .await
        .unwrap();
    let credentials = agent.credentials.get_client_credentials().await.unwrap();

    let provider = MtlsClientProvider::new(agent.csr_provider.clone(), Duration::from_secs(10));
    assert!(provider.create_client(&credentials).is_ok());
}

// =============================================================================
// Renewal
// =============================================================================

/// Story: Renewal rotates the key and replaces the stored certificate
///
/// The agent follows the renewal URL from the management info, submits a
/// CSR for a fresh key, and after preservation the stored key and chain
/// belong together again. The initial CSR key record is left as it was.
#[tokio::test]
async fn story_renewal_rotates_key_and_certificate() {
    let connector = FakeConnector::start().await;
    let agent = Agent::new();

    let established = agent
        .handshake
        .establish(&connector.csr_info_url())
        .await
        .unwrap();
    agent
        .preserver
        .preserve_certificates(&established.bundle)
        .await
        .unwrap();
    let before = agent.credentials.get_client_credentials().await.unwrap();

    // No TLS on the fake connector, so the identity is left off the client
    let subject = before.certificate_info().unwrap().subject;
    let client = MtlsClient::new(reqwest::Client::new(), agent.csr_provider.clone(), subject);

    let info = client
        .management_info(&established.management_info_url)
        .await
        .unwrap();
    assert_eq!(info.urls.renew_cert_url, connector.renewal_url());
    assert_eq!(info.client_identity.application, "ec-default");

    let renewed = client
        .renew_certificate(&info.urls.renew_cert_url)
        .await
        .unwrap();
    agent.preserver.preserve_certificates(&renewed).await.unwrap();

    let after = agent.credentials.get_client_credentials().await.unwrap();
    assert_ne!(*after.client_key, *before.client_key);
    assert_ne!(after.certificate_chain, before.certificate_chain);
    assert_eq!(
        public_key_of(&after.client_key),
        public_key_of_certificate(&after.certificate_chain)
    );
    assert_eq!(after.ca_certificate, before.ca_certificate);
    assert_eq!(
        after.certificate_info().unwrap().subject,
        Subject::parse(SUBJECT)
    );

    let csr_key = agent.secrets.get(&agent.config.csr_key_secret).await.unwrap();
    assert_eq!(
        String::from_utf8(csr_key[PRIVATE_KEY_KEY].clone()).unwrap(),
        *before.client_key
    );
    assert_eq!(connector.received_csrs().len(), 2);
}

/// Story: Renewal clients can be shared across tasks
#[tokio::test]
async fn story_renewal_client_is_usable_behind_a_trait_object() {
    let connector = FakeConnector::start().await;
    let agent = Agent::new();

    let client: Arc<dyn EstablishedConnectionClient> = Arc::new(MtlsClient::new(
        reqwest::Client::new(),
        agent.csr_provider.clone(),
        Subject::parse(SUBJECT),
    ));

    let renewal_url = connector.renewal_url();
    let task = tokio::spawn(async move { client.renew_certificate(&renewal_url).await });
    let bundle = task.await.unwrap().unwrap();

    let key = bundle.client_key.as_ref().unwrap();
    let chain = String::from_utf8(bundle.chain.clone()).unwrap();
    assert_eq!(public_key_of(key), public_key_of_certificate(&chain));
}
