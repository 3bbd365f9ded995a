//! Error types for the Tether controller

use std::time::Duration;

use thiserror::Error;

use crate::connector::ConnectorError;
use crate::pki::PkiError;
use crate::secrets::StoreError;

/// Main error type for Tether operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Credential store error
    #[error("credential store error: {0}")]
    Store(#[from] StoreError),

    /// Key or certificate handling error
    #[error("pki error: {0}")]
    Pki(#[from] PkiError),

    /// Central connector communication error
    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),

    /// Validation error for CentralConnection specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Stored credentials are missing a required field
    #[error("incomplete credentials: {0}")]
    IncompleteCredentials(String),

    /// A reconcile stage did not finish in time
    #[error("timed out after {after:?}")]
    Timeout {
        /// Stage that timed out
        stage: &'static str,
        /// Configured step timeout
        after: Duration,
    },

    /// A reconcile stage failed
    #[error("{stage} failed: {source}")]
    Stage {
        /// Stage that failed
        stage: &'static str,
        /// Underlying error
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Wrap an error with the name of the reconcile stage it came from
    pub fn stage(stage: &'static str, source: impl Into<Error>) -> Self {
        Self::Stage {
            stage,
            source: Box::new(source.into()),
        }
    }

    /// Whether this is an optimistic concurrency conflict worth retrying
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(ae)) => ae.code == 409,
            Error::Store(StoreError::Conflict(_)) => true,
            Error::Stage { source, .. } => source.is_conflict(),
            _ => false,
        }
    }

    /// Whether the target object no longer exists
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(ae)) => ae.code == 404,
            Error::Store(StoreError::NotFound(_)) => true,
            Error::Stage { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}
