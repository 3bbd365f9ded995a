//! In-process credential store
//!
//! Mirrors the Kubernetes semantics (versioned records, compare-and-swap
//! updates) so the repository and controller can be exercised without an
//! API server.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{CredentialRecord, SecretData, SecretName, SecretStore, StoreError};

/// Versioned in-memory [`SecretStore`]
#[derive(Default)]
pub struct MemorySecretStore {
    records: RwLock<HashMap<SecretName, (SecretData, u64)>>,
    next_version: RwLock<u64>,
}

impl MemorySecretStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self) -> u64 {
        let mut v = self.next_version.write();
        *v += 1;
        *v
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, name: &SecretName) -> Result<CredentialRecord, StoreError> {
        self.records
            .read()
            .get(name)
            .map(|(data, version)| CredentialRecord {
                name: name.clone(),
                data: data.clone(),
                version: Some(version.to_string()),
            })
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn create(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        let version = self.bump();
        let mut records = self.records.write();
        if records.contains_key(&record.name) {
            return Err(StoreError::AlreadyExists(record.name.to_string()));
        }
        records.insert(record.name.clone(), (record.data.clone(), version));
        Ok(())
    }

    async fn update(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        let version = self.bump();
        let mut records = self.records.write();
        let Some((data, current)) = records.get_mut(&record.name) else {
            return Err(StoreError::NotFound(record.name.to_string()));
        };
        if let Some(expected) = &record.version {
            if *expected != current.to_string() {
                return Err(StoreError::Conflict(record.name.to_string()));
            }
        }
        *data = record.data.clone();
        *current = version;
        Ok(())
    }

    async fn delete(&self, name: &SecretName) -> Result<(), StoreError> {
        self.records.write().remove(name);
        Ok(())
    }
}
