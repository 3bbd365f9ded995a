//! The agent's current credential set
//!
//! Credentials are split over three records: the key-only record used for
//! the first CSR, the client record (`crt`, `key`) and the CA record
//! (`ca.crt`). [`credentials`] reads them back for the mTLS client,
//! [`preserver`] writes newly issued certificates.

pub mod credentials;
pub mod preserver;

pub use credentials::{CredentialsProvider, SecretCredentialsProvider};
pub use preserver::{Preserver, SecretPreserver};
