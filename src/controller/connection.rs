//! CentralConnection controller implementation
//!
//! Each reconcile decides between three paths:
//!
//! - no credentials stored: run the handshake against `spec.csrInfoUrl`
//! - credentials stored: fetch management info over mTLS
//! - credentials close to expiry or `spec.renewNow` set: renew over mTLS
//!
//! and writes the outcome to the resource status. Synchronizations are
//! throttled to one per minimal sync period unless a renewal is forced.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::certificates::{
    CredentialsProvider, Preserver, SecretCredentialsProvider, SecretPreserver,
};
use crate::config::{CertificateConfig, ControllerConfig};
use crate::connector::{ClientProvider, HandshakeClient, HttpHandshakeClient, MtlsClientProvider};
use crate::crd::{
    format_time, CentralConnection, CentralConnectionStatus, CertificateStatus, ConnectionPhase,
    StatusError, SynchronizationStatus,
};
use crate::pki::{CertificateBundle, CertificateInfo, CsrProvider, RsaCsrProvider};
use crate::retry::retry_on_conflict;
use crate::secrets::{KubeSecretStore, SecretRepository, SecretStore};
use crate::Error;

/// Trait abstracting Kubernetes operations on CentralConnection resources
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionClient: Send + Sync {
    /// Read the latest version of a connection, `None` if it was deleted
    async fn get(&self, name: &str) -> Result<Option<CentralConnection>, Error>;

    /// Replace the connection object (spec and metadata)
    async fn replace(&self, connection: &CentralConnection) -> Result<CentralConnection, Error>;

    /// Replace the status subresource
    ///
    /// The write carries the object's resourceVersion, so a concurrent
    /// change fails with a 409 conflict.
    async fn replace_status(&self, connection: &CentralConnection) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeConnectionClient {
    client: Client,
}

impl KubeConnectionClient {
    /// Create a new KubeConnectionClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self) -> Api<CentralConnection> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ConnectionClient for KubeConnectionClient {
    async fn get(&self, name: &str) -> Result<Option<CentralConnection>, Error> {
        Ok(self.api().get_opt(name).await?)
    }

    async fn replace(&self, connection: &CentralConnection) -> Result<CentralConnection, Error> {
        Ok(self
            .api()
            .replace(&connection.name_any(), &PostParams::default(), connection)
            .await?)
    }

    async fn replace_status(&self, connection: &CentralConnection) -> Result<(), Error> {
        let data = serde_json::to_vec(connection)
            .map_err(|e| Error::serialization(format!("failed to encode status: {}", e)))?;
        self.api()
            .replace_status(&connection.name_any(), &PostParams::default(), data)
            .await?;
        Ok(())
    }
}

/// Controller context shared by all reconciles
pub struct Context {
    /// CentralConnection API access
    pub connections: Arc<dyn ConnectionClient>,
    /// Stored credential lookup
    pub credentials: Arc<dyn CredentialsProvider>,
    /// First-time connection
    pub handshake: Arc<dyn HandshakeClient>,
    /// mTLS clients built from stored credentials
    pub client_provider: Arc<dyn ClientProvider>,
    /// Storage of issued certificates
    pub preserver: Arc<dyn Preserver>,
    /// Loop timing
    pub config: ControllerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        connections: Arc<dyn ConnectionClient>,
        credentials: Arc<dyn CredentialsProvider>,
        handshake: Arc<dyn HandshakeClient>,
        client_provider: Arc<dyn ClientProvider>,
        preserver: Arc<dyn Preserver>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            connections,
            credentials,
            handshake,
            client_provider,
            preserver,
            config,
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// Everything not overridden is built on the Kubernetes client: Secrets
/// for key material, the CentralConnection API for status.
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .certificates(CertificateConfig::in_namespace("agents"))
///     .config(controller_config)
///     .build()?;
/// ```
pub struct ContextBuilder {
    client: Client,
    certificates: CertificateConfig,
    config: ControllerConfig,
    secret_store: Option<Arc<dyn SecretStore>>,
    connections: Option<Arc<dyn ConnectionClient>>,
    handshake: Option<Arc<dyn HandshakeClient>>,
    client_provider: Option<Arc<dyn ClientProvider>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            certificates: CertificateConfig::default(),
            config: ControllerConfig::default(),
            secret_store: None,
            connections: None,
            handshake: None,
            client_provider: None,
        }
    }

    /// Set where key material is stored and how keys are generated
    pub fn certificates(mut self, certificates: CertificateConfig) -> Self {
        self.certificates = certificates;
        self
    }

    /// Set loop timing
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the credential store backend
    pub fn secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secret_store = Some(store);
        self
    }

    /// Override the CentralConnection client
    pub fn connection_client(mut self, connections: Arc<dyn ConnectionClient>) -> Self {
        self.connections = Some(connections);
        self
    }

    /// Override the handshake client
    pub fn handshake_client(mut self, handshake: Arc<dyn HandshakeClient>) -> Self {
        self.handshake = Some(handshake);
        self
    }

    /// Override the mTLS client provider
    pub fn client_provider(mut self, provider: Arc<dyn ClientProvider>) -> Self {
        self.client_provider = Some(provider);
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context, Error> {
        self.config.validate()?;

        let store = self
            .secret_store
            .unwrap_or_else(|| Arc::new(KubeSecretStore::new(self.client.clone())));
        let secrets = SecretRepository::new(store);
        let csr_provider: Arc<dyn CsrProvider> =
            Arc::new(RsaCsrProvider::new(secrets.clone(), &self.certificates));

        let handshake = match self.handshake {
            Some(handshake) => handshake,
            None => Arc::new(HttpHandshakeClient::new(
                csr_provider.clone(),
                self.config.request_timeout,
            )?),
        };
        let client_provider = self.client_provider.unwrap_or_else(|| {
            Arc::new(MtlsClientProvider::new(
                csr_provider,
                self.config.request_timeout,
            ))
        });

        Ok(Context {
            connections: self
                .connections
                .unwrap_or_else(|| Arc::new(KubeConnectionClient::new(self.client.clone()))),
            credentials: Arc::new(SecretCredentialsProvider::new(
                secrets.clone(),
                &self.certificates,
            )),
            handshake,
            client_provider,
            preserver: Arc::new(SecretPreserver::new(secrets, &self.certificates)),
            config: self.config,
        })
    }
}

/// What a successful synchronization learned
struct SyncOutcome {
    /// The certificate now stored
    certificate: CertificateInfo,
    /// Management info URL announced by a handshake
    management_info_url: Option<String>,
    /// Whether a new certificate was issued
    issued: bool,
}

/// Reconcile a CentralConnection resource
///
/// Returns the requeue action for the next synchronization. Failures are
/// recorded in the status and returned so that [`error_policy`] requeues.
#[instrument(skip(connection, ctx), fields(connection = %connection.name_any()))]
pub async fn reconcile(
    connection: Arc<CentralConnection>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = connection.name_any();
    let now = Utc::now();
    let min_sync = ctx.config.minimal_sync_period;
    let renew_now = connection.spec.renew_now;
    let last_sync = connection
        .status
        .as_ref()
        .and_then(CentralConnectionStatus::last_sync);

    if !should_synchronize(last_sync, renew_now, now, min_sync) {
        let wait = time_until_next_sync(last_sync, now, min_sync);
        debug!(wait_secs = wait.as_secs(), "synchronized recently, skipping");
        return Ok(Action::requeue(wait));
    }

    match synchronize(&name, &connection, &ctx, now).await {
        Ok(outcome) => {
            let issued = outcome.issued;
            let not_after = outcome.certificate.not_after;
            record_success(&name, &ctx, renew_now, outcome, now)
                .await
                .map_err(|e| Error::stage("update status", e))?;
            info!(issued, %not_after, "connection synchronized");
            Ok(Action::requeue(min_sync))
        }
        Err(error) => {
            error!(stage = stage_of(&error), %error, "synchronization failed");
            if let Err(status_error) = record_failure(&name, &ctx, renew_now, &error, now).await
            {
                warn!(error = %status_error, "failed to record error in status");
            }
            Err(error)
        }
    }
}

/// Error policy for the controller
///
/// Requeues after a short fixed delay; the sync throttle in [`reconcile`]
/// keeps the connector from being hammered.
pub fn error_policy(
    connection: Arc<CentralConnection>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    error!(
        ?error,
        connection = %connection.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

/// Whether a synchronization is due
///
/// A last sync in the future (clock skew) counts as due.
pub fn should_synchronize(
    last_sync: Option<DateTime<Utc>>,
    renew_now: bool,
    now: DateTime<Utc>,
    minimal_sync_period: Duration,
) -> bool {
    if renew_now {
        return true;
    }
    match last_sync.map(|last| (now - last).to_std()) {
        None | Some(Err(_)) => true,
        Some(Ok(elapsed)) => elapsed >= minimal_sync_period,
    }
}

/// Whether the certificate should be renewed now
///
/// Renew when forced, when less than `threshold` of the validity window is
/// left, or when less than two sync periods are left.
pub fn should_renew(
    certificate: &CertificateInfo,
    renew_now: bool,
    now: DateTime<Utc>,
    threshold: f64,
    minimal_sync_period: Duration,
) -> bool {
    if renew_now {
        return true;
    }
    let Ok(remaining) = certificate.remaining_at(now).to_std() else {
        return true;
    };
    let validity = certificate.validity().to_std().unwrap_or_default();

    remaining < validity.mul_f64(threshold) || remaining < minimal_sync_period.saturating_mul(2)
}

fn time_until_next_sync(
    last_sync: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    minimal_sync_period: Duration,
) -> Duration {
    let elapsed = last_sync
        .and_then(|last| (now - last).to_std().ok())
        .unwrap_or_default();
    minimal_sync_period
        .saturating_sub(elapsed)
        .max(Duration::from_secs(1))
}

fn stage_of(error: &Error) -> &'static str {
    match error {
        Error::Stage { stage, .. } => *stage,
        _ => "reconcile",
    }
}

/// Run one stage under the step timeout, tagging failures with its name
async fn run_stage<T, E, Fut>(ctx: &Context, stage: &'static str, fut: Fut) -> Result<T, Error>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<Error>,
{
    let after = ctx.config.step_timeout;
    match tokio::time::timeout(after, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Error::stage(stage, e)),
        Err(_) => Err(Error::stage(stage, Error::Timeout { stage, after })),
    }
}

async fn synchronize(
    name: &str,
    connection: &CentralConnection,
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<SyncOutcome, Error> {
    connection
        .spec
        .validate()
        .map_err(|e| Error::stage("validate spec", e))?;

    let exists = run_stage(ctx, "check credentials", ctx.credentials.credentials_exist()).await?;
    if exists {
        maintain(name, connection, ctx, now).await
    } else {
        establish(connection, ctx).await
    }
}

/// First certificate through the unauthenticated handshake
async fn establish(connection: &CentralConnection, ctx: &Context) -> Result<SyncOutcome, Error> {
    let csr_info_url = connection.spec.csr_info_url.as_str();
    if csr_info_url.is_empty() {
        return Err(Error::stage(
            "establish connection",
            Error::validation("no credentials stored and spec.csrInfoUrl is empty"),
        ));
    }

    info!(url = %csr_info_url, "no credentials stored, establishing connection");
    let established = run_stage(
        ctx,
        "establish connection",
        ctx.handshake.establish(csr_info_url),
    )
    .await?;
    let certificate = issued_certificate(&established.bundle)?;
    run_stage(
        ctx,
        "preserve certificates",
        ctx.preserver.preserve_certificates(&established.bundle),
    )
    .await?;

    Ok(SyncOutcome {
        certificate,
        management_info_url: Some(established.management_info_url),
        issued: true,
    })
}

/// Management info sync, renewing when due
async fn maintain(
    name: &str,
    connection: &CentralConnection,
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<SyncOutcome, Error> {
    let credentials = run_stage(
        ctx,
        "read credentials",
        ctx.credentials.get_client_credentials(),
    )
    .await?;
    let current = credentials
        .certificate_info()
        .map_err(|e| Error::stage("read certificate", e))?;
    let client = ctx
        .client_provider
        .create_client(&credentials)
        .map_err(|e| Error::stage("create client", e))?;

    let info_url = connection.management_info_url().ok_or_else(|| {
        Error::stage(
            "fetch management info",
            Error::validation("no management info URL known, set spec.managementInfoUrl"),
        )
    })?;
    let management =
        run_stage(ctx, "fetch management info", client.management_info(info_url)).await?;
    debug!(
        application = %management.client_identity.application,
        tenant = %management.client_identity.tenant,
        "fetched management info"
    );

    let renew_now = connection.spec.renew_now;
    if !should_renew(
        &current,
        renew_now,
        now,
        ctx.config.renewal_threshold,
        ctx.config.minimal_sync_period,
    ) {
        return Ok(SyncOutcome {
            certificate: current,
            management_info_url: None,
            issued: false,
        });
    }

    info!(not_after = %current.not_after, forced = renew_now, "renewing certificate");
    update_status(name, ctx, false, |status| {
        status.phase = ConnectionPhase::Renewing;
    })
    .await
    .map_err(|e| Error::stage("update status", e))?;

    let renew_url = management.urls.renew_cert_url.as_str();
    if renew_url.is_empty() {
        return Err(Error::stage(
            "renew certificate",
            Error::validation("management info has no renewCertUrl"),
        ));
    }
    let bundle = run_stage(ctx, "renew certificate", client.renew_certificate(renew_url)).await?;
    let certificate = issued_certificate(&bundle)?;
    run_stage(
        ctx,
        "preserve certificates",
        ctx.preserver.preserve_certificates(&bundle),
    )
    .await?;

    Ok(SyncOutcome {
        certificate,
        management_info_url: None,
        issued: true,
    })
}

/// Parse the leaf of an issued chain; runs before anything is stored
fn issued_certificate(bundle: &CertificateBundle) -> Result<CertificateInfo, Error> {
    let chain = String::from_utf8_lossy(&bundle.chain);
    CertificateInfo::from_pem(&chain).map_err(|e| Error::stage("read certificate", e))
}

async fn record_success(
    name: &str,
    ctx: &Context,
    reset_renew_now: bool,
    outcome: SyncOutcome,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    let certificate_status = CertificateStatus::from_info(&outcome.certificate);
    let stamp = format_time(now);

    update_status(name, ctx, reset_renew_now, |status| {
        status.phase = ConnectionPhase::Connected;
        status.certificate_status = Some(certificate_status.clone());
        if let Some(url) = &outcome.management_info_url {
            status.management_info_url = Some(url.clone());
        }
        status.synchronization_status = Some(SynchronizationStatus {
            last_sync: Some(stamp.clone()),
            last_success: Some(stamp.clone()),
        });
        status.error = None;
    })
    .await
}

/// Record a failed synchronization
///
/// A forced renewal is not retried until the next sync period, so
/// `renewNow` is cleared here as well.
async fn record_failure(
    name: &str,
    ctx: &Context,
    reset_renew_now: bool,
    error: &Error,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    let message = error.to_string();
    let stamp = format_time(now);

    update_status(name, ctx, reset_renew_now, |status| {
        status.phase = ConnectionPhase::Error;
        status.error = Some(StatusError {
            message: message.clone(),
        });
        status
            .synchronization_status
            .get_or_insert_with(SynchronizationStatus::default)
            .last_sync = Some(stamp.clone());
    })
    .await
}

/// Apply `mutate` to the latest status, retrying on conflicts
///
/// Every attempt re-reads the object. With `reset_renew_now` the spec flag
/// is cleared first. A deleted object ends the update without error.
async fn update_status<F>(
    name: &str,
    ctx: &Context,
    reset_renew_now: bool,
    mutate: F,
) -> Result<(), Error>
where
    F: Fn(&mut CentralConnectionStatus) + Send + Sync,
{
    let mutate = &mutate;
    retry_on_conflict(&ctx.config.status_retry, "update status", || async move {
        let Some(mut latest) = ctx.connections.get(name).await? else {
            info!("connection deleted, dropping status update");
            return Ok(());
        };

        if reset_renew_now && latest.spec.renew_now {
            latest.spec.renew_now = false;
            latest = ctx.connections.replace(&latest).await?;
            debug!("reset renewNow");
        }

        let mut status = latest.status.take().unwrap_or_default();
        mutate(&mut status);
        latest.status = Some(status);

        match ctx.connections.replace_status(&latest).await {
            Err(e) if e.is_not_found() => {
                info!("connection deleted, dropping status update");
                Ok(())
            }
            result => result,
        }
    })
    .await
}
