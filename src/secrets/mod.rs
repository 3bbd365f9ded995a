//! Credential store abstraction
//!
//! Key material and certificates are kept in namespaced records of named
//! byte fields (Kubernetes Secrets in production). [`SecretStore`] is the
//! raw backend seam; [`SecretRepository`] layers the read/replace/merge
//! semantics the rest of the controller relies on.

mod kubernetes;
mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

pub use self::kubernetes::KubeSecretStore;
pub use self::memory::MemorySecretStore;

/// Field name to raw bytes
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Namespaced name of a credential record
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretName {
    /// Namespace of the record
    pub namespace: String,
    /// Name of the record
    pub name: String,
}

impl SecretName {
    /// Create a new record name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SecretName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A credential record as held by the store
#[derive(Clone, Debug, PartialEq)]
pub struct CredentialRecord {
    /// Record name
    pub name: SecretName,
    /// Record fields
    pub data: SecretData,
    /// Optimistic concurrency token, `None` for records not yet stored
    pub version: Option<String>,
}

impl CredentialRecord {
    /// A record that has not been written yet
    pub fn new(name: SecretName, data: SecretData) -> Self {
        Self {
            name,
            data,
            version: None,
        }
    }
}

/// Credential store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// The record does not exist
    #[error("record {0} not found")]
    NotFound(String),

    /// The record already exists (on create)
    #[error("record {0} already exists")]
    AlreadyExists(String),

    /// The record changed since it was read (on update)
    #[error("record {0} was modified concurrently")]
    Conflict(String),

    /// Any other backend failure
    #[error("backend error on {name}: {message}")]
    Backend {
        /// Record the operation targeted
        name: String,
        /// Backend error message
        message: String,
    },
}

impl StoreError {
    /// Create a backend error for the given record
    pub fn backend(name: &SecretName, message: impl Into<String>) -> Self {
        Self::Backend {
            name: name.to_string(),
            message: message.into(),
        }
    }
}

/// Raw credential store operations
///
/// Implementations must distinguish not-found, already-exists and conflict
/// outcomes so that [`SecretRepository`] can build its upsert semantics.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Read a record
    async fn get(&self, name: &SecretName) -> Result<CredentialRecord, StoreError>;

    /// Create a record, failing with `AlreadyExists` if present
    async fn create(&self, record: &CredentialRecord) -> Result<(), StoreError>;

    /// Overwrite a record, failing with `Conflict` if `record.version` is stale
    async fn update(&self, record: &CredentialRecord) -> Result<(), StoreError>;

    /// Delete a record
    async fn delete(&self, name: &SecretName) -> Result<(), StoreError>;
}

/// Read, replace and merge semantics over a [`SecretStore`]
#[derive(Clone)]
pub struct SecretRepository {
    store: Arc<dyn SecretStore>,
}

impl SecretRepository {
    /// Create a repository over the given store
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Read the fields of a record
    pub async fn get(&self, name: &SecretName) -> Result<SecretData, StoreError> {
        Ok(self.store.get(name).await?.data)
    }

    /// Make the record contain exactly `data`
    ///
    /// Creates the record; if it already exists it is deleted and created
    /// again. A failed delete fails the whole operation.
    pub async fn upsert_with_replace(
        &self,
        name: &SecretName,
        data: SecretData,
    ) -> Result<(), StoreError> {
        let record = CredentialRecord::new(name.clone(), data);

        match self.store.create(&record).await {
            Ok(()) => {
                debug!(secret = %name, "created record");
                Ok(())
            }
            Err(StoreError::AlreadyExists(_)) => {
                self.store.delete(name).await?;
                self.store.create(&record).await?;
                info!(secret = %name, "replaced record");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Overlay `data` onto the record, keeping fields not named in `data`
    ///
    /// A missing record is treated as empty. The update carries the version
    /// read first, so a concurrent write surfaces as `Conflict`. If the
    /// record disappears between read and update it is created once.
    pub async fn upsert_with_merge(
        &self,
        name: &SecretName,
        data: SecretData,
    ) -> Result<(), StoreError> {
        let (mut merged, version) = match self.store.get(name).await {
            Ok(existing) => (existing.data, existing.version),
            Err(StoreError::NotFound(_)) => (SecretData::new(), None),
            Err(e) => return Err(e),
        };
        merged.extend(data);

        let record = CredentialRecord {
            name: name.clone(),
            data: merged,
            version,
        };

        if record.version.is_none() {
            return self.store.create(&record).await;
        }

        match self.store.update(&record).await {
            Ok(()) => {
                debug!(secret = %name, "merged into record");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => {
                debug!(secret = %name, "record vanished before update, creating");
                self.store
                    .create(&CredentialRecord::new(record.name, record.data))
                    .await
            }
            Err(e) => Err(e),
        }
    }
}
