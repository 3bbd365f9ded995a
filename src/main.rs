//! Tether - certificate lifecycle controller for connected agents

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use tether::config::{CertificateConfig, ControllerConfig};
use tether::controller::{error_policy, reconcile, Context};
use tether::crd::CentralConnection;
use tether::retry::{retry_with_backoff, RetryConfig};
use tether::secrets::MemorySecretStore;
use tether::telemetry::{init_telemetry, TelemetryConfig};

/// Tether - keeps an agent's client certificate for a central connector valid
#[derive(Parser, Debug)]
#[command(name = "tether", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Namespace of the key and certificate Secrets
    #[arg(long, env = "TETHER_SECRETS_NAMESPACE", default_value = tether::DEFAULT_SECRETS_NAMESPACE)]
    secrets_namespace: String,

    /// Secret holding the key for the initial CSR
    #[arg(long, env = "TETHER_CSR_KEY_SECRET", default_value = tether::DEFAULT_CSR_KEY_SECRET)]
    csr_key_secret: String,

    /// Secret holding the client certificate chain and key
    #[arg(long, env = "TETHER_CLIENT_CERT_SECRET", default_value = tether::DEFAULT_CLIENT_CERT_SECRET)]
    client_cert_secret: String,

    /// Secret holding the connector CA certificate
    #[arg(long, env = "TETHER_CA_CERT_SECRET", default_value = tether::DEFAULT_CA_CERT_SECRET)]
    ca_cert_secret: String,

    /// RSA modulus size for generated keys
    #[arg(long, env = "TETHER_RSA_KEY_BITS", default_value_t = tether::DEFAULT_RSA_KEY_BITS)]
    rsa_key_bits: usize,

    /// Minimal seconds between two synchronizations
    #[arg(long, env = "TETHER_MINIMAL_SYNC_PERIOD_SECS", default_value_t = tether::DEFAULT_MINIMAL_SYNC_PERIOD_SECS)]
    minimal_sync_period_secs: u64,

    /// Renew once less than this fraction of the validity is left
    #[arg(long, env = "TETHER_RENEWAL_THRESHOLD", default_value_t = tether::DEFAULT_RENEWAL_THRESHOLD)]
    renewal_threshold: f64,

    /// Timeout in seconds for a single connector request
    #[arg(long, env = "TETHER_REQUEST_TIMEOUT_SECS", default_value_t = tether::DEFAULT_REQUEST_TIMEOUT_SECS)]
    request_timeout_secs: u64,

    /// Timeout in seconds for a single reconcile stage
    #[arg(long, env = "TETHER_STEP_TIMEOUT_SECS", default_value_t = tether::DEFAULT_STEP_TIMEOUT_SECS)]
    step_timeout_secs: u64,

    /// Keep key material in memory instead of Secrets (local runs only)
    #[arg(long, env = "TETHER_IN_MEMORY_SECRETS")]
    in_memory_secrets: bool,

    /// Human readable logs instead of JSON
    #[arg(long, env = "TETHER_TEXT_LOGS")]
    text_logs: bool,
}

impl Cli {
    fn certificate_config(&self) -> CertificateConfig {
        let mut config = CertificateConfig::in_namespace(&self.secrets_namespace);
        config.rsa_key_bits = self.rsa_key_bits;
        config.csr_key_secret.name = self.csr_key_secret.clone();
        config.client_cert_secret.name = self.client_cert_secret.clone();
        config.ca_cert_secret.name = self.ca_cert_secret.clone();
        config
    }

    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            minimal_sync_period: Duration::from_secs(self.minimal_sync_period_secs),
            renewal_threshold: self.renewal_threshold,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            step_timeout: Duration::from_secs(self.step_timeout_secs),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Both kube and the connector clients need a process-wide provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             TLS connections to the API server and the connector cannot be made.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&CentralConnection::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        json: !cli.text_logs,
        ..Default::default()
    })?;

    run_controller(cli).await
}

/// Run the CentralConnection controller until a shutdown signal arrives
async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("Tether controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    // The API server may still be coming up when we start in the same pod
    let startup_retry = RetryConfig::with_max_attempts(10);
    let version = retry_with_backoff(&startup_retry, "connect to API server", || {
        client.apiserver_version()
    })
    .await
    .map_err(|e| anyhow::anyhow!("API server unreachable: {}", e))?;
    tracing::info!(version = %version.git_version, "connected to API server");

    ensure_crd_installed(&client).await?;

    let certificates = cli.certificate_config();
    let mut builder = Context::builder(client.clone())
        .certificates(certificates.clone())
        .config(cli.controller_config());
    if cli.in_memory_secrets {
        tracing::warn!("keeping key material in memory, credentials are lost on restart");
        builder = builder.secret_store(Arc::new(MemorySecretStore::new()));
    }
    let ctx = Arc::new(
        builder
            .build()
            .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?,
    );

    tracing::info!(
        client_secret = %certificates.client_cert_secret,
        ca_secret = %certificates.ca_cert_secret,
        "Starting CentralConnection controller"
    );

    let connections: Api<CentralConnection> = Api::all(client);
    Controller::new(connections, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Connection reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Connection reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Tether controller stopped");
    Ok(())
}

/// Install the CentralConnection CRD with server-side apply
///
/// Keeps the CRD version in line with the controller version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("tether-controller").force();

    tracing::info!("Installing CentralConnection CRD...");
    crds.patch(
        "centralconnections.tether.dev",
        &params,
        &Patch::Apply(&CentralConnection::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install CentralConnection CRD: {}", e))?;

    Ok(())
}
