//! Tether - certificate lifecycle controller for connected agents
//!
//! Tether keeps the client certificate of a cluster agent valid against a
//! remote central connector. The agent bootstraps trust through an
//! unauthenticated handshake (CSR info, then CSR submission) and afterwards
//! talks to the connector over mTLS to fetch management info and renew its
//! certificate before it expires.
//!
//! # Architecture
//!
//! - Key material and certificates live in Kubernetes Secrets
//! - A `CentralConnection` resource describes each connector and carries status
//! - A periodic reconcile loop decides whether to handshake, sync, or renew
//!
//! # Modules
//!
//! - [`pki`] - CSR generation, subject parsing, certificate bundles
//! - [`secrets`] - Credential store abstraction and adapters
//! - [`connector`] - Handshake and mTLS clients for the central connector
//! - [`certificates`] - Reading and preserving the current credential set
//! - [`crd`] - The `CentralConnection` custom resource
//! - [`controller`] - Reconciliation of `CentralConnection` resources
//! - [`config`] - Runtime configuration
//! - [`retry`] - Bounded retry with backoff
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod certificates;
pub mod config;
pub mod connector;
pub mod controller;
pub mod crd;
pub mod error;
pub mod pki;
pub mod retry;
pub mod secrets;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Shared by the CLI defaults, the config structs, and test fixtures.

/// Namespace holding the agent's key and certificate Secrets
pub const DEFAULT_SECRETS_NAMESPACE: &str = "tether-system";

/// Secret holding only the private key used for the initial CSR
pub const DEFAULT_CSR_KEY_SECRET: &str = "tether-csr-key";

/// Secret holding the client certificate chain and its private key
pub const DEFAULT_CLIENT_CERT_SECRET: &str = "tether-client-certificate";

/// Secret holding the connector's CA certificate
pub const DEFAULT_CA_CERT_SECRET: &str = "tether-ca-certificate";

/// Data key for a PEM private key
pub const PRIVATE_KEY_KEY: &str = "key";

/// Data key for a PEM client certificate chain
pub const CERTIFICATE_KEY: &str = "crt";

/// Data key for a PEM CA certificate
pub const CA_CERTIFICATE_KEY: &str = "ca.crt";

/// RSA modulus size for generated keys
pub const DEFAULT_RSA_KEY_BITS: usize = 4096;

/// Renew once less than this fraction of the validity window remains
pub const DEFAULT_RENEWAL_THRESHOLD: f64 = 0.3;

/// Minimal interval between two synchronizations with the connector
pub const DEFAULT_MINIMAL_SYNC_PERIOD_SECS: u64 = 300;

/// Timeout for a single HTTP request to the connector
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Timeout for a single reconcile stage
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 60;

/// Value of the `app.kubernetes.io/managed-by` label on Secrets we create
pub const MANAGED_BY: &str = "tether";
