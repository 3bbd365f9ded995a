//! Kubernetes Secret backed credential store

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, ObjectMeta, PostParams};
use kube::{Api, Client};

use super::{CredentialRecord, SecretData, SecretName, SecretStore, StoreError};
use crate::MANAGED_BY;

/// [`SecretStore`] over the Kubernetes Secrets API
///
/// Versions are Secret `resourceVersion`s, so updates are rejected by the
/// API server with 409 when the Secret changed after it was read.
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, name: &SecretName) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &name.namespace)
    }
}

/// Map a Kubernetes API error onto the store's error categories
fn map_error(name: &SecretName, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(name.to_string()),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            StoreError::AlreadyExists(name.to_string())
        }
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(name.to_string()),
        e => StoreError::backend(name, e.to_string()),
    }
}

fn secret_data(record: &CredentialRecord) -> BTreeMap<String, ByteString> {
    record
        .data
        .iter()
        .map(|(k, v)| (k.clone(), ByteString(v.clone())))
        .collect()
}

fn to_secret(record: &CredentialRecord) -> Secret {
    let data = secret_data(record);

    Secret {
        metadata: ObjectMeta {
            name: Some(record.name.name.clone()),
            namespace: Some(record.name.namespace.clone()),
            resource_version: record.version.clone(),
            labels: Some(
                [(
                    "app.kubernetes.io/managed-by".to_string(),
                    MANAGED_BY.to_string(),
                )]
                .into(),
            ),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Replace the data of `existing`, keeping its metadata and `type`
///
/// The record's version becomes the resourceVersion precondition.
fn to_replacement(mut existing: Secret, record: &CredentialRecord) -> Secret {
    existing.metadata.resource_version = record.version.clone();
    existing
        .metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .entry("app.kubernetes.io/managed-by".to_string())
        .or_insert_with(|| MANAGED_BY.to_string());
    existing.data = Some(secret_data(record));
    existing.string_data = None;
    existing
}

fn from_secret(name: &SecretName, secret: Secret) -> CredentialRecord {
    let data: SecretData = secret
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.0))
        .collect();

    CredentialRecord {
        name: name.clone(),
        data,
        version: secret.metadata.resource_version,
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, name: &SecretName) -> Result<CredentialRecord, StoreError> {
        let secret = self
            .api(name)
            .get(&name.name)
            .await
            .map_err(|e| map_error(name, e))?;
        Ok(from_secret(name, secret))
    }

    async fn create(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        let mut secret = to_secret(record);
        secret.metadata.resource_version = None;
        self.api(&record.name)
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|e| map_error(&record.name, e))?;
        Ok(())
    }

    async fn update(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        let api = self.api(&record.name);
        let existing = api
            .get(&record.name.name)
            .await
            .map_err(|e| map_error(&record.name, e))?;
        api.replace(
            &record.name.name,
            &PostParams::default(),
            &to_replacement(existing, record),
        )
        .await
        .map_err(|e| map_error(&record.name, e))?;
        Ok(())
    }

    async fn delete(&self, name: &SecretName) -> Result<(), StoreError> {
        match self
            .api(name)
            .delete(&name.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(map_error(name, e)),
        }
    }
}
