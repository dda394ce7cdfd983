//! Kubernetes drivers: resource documents as custom resources, secrets as
//! `v1/Secret` objects, both in a single configured namespace.
//!
//! The API server's `resourceVersion` doubles as the ETag, so optimistic
//! concurrency rides on the server's own conflict detection.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{ByteString, api::core::v1::Secret};
use kube::{
    Api, Client, CustomResource, ResourceExt,
    api::{DeleteParams, ListParams, ObjectMeta, PostParams},
};
use radius_resource::ResourceId;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::ResultExt;

use crate::{
    DEFAULT_QUERY_LIMIT, Entry, Etag, KubernetesSnafu, Page, Query, StateStore, StoreError,
    WritePrecondition, normalized_key, normalized_scope,
    retry::{BackoffPolicy, with_backoff},
    secrets::{self, SecretScope, SecretStore, SecretStoreError},
};

/// The custom resource a UCP document is persisted as.
///
/// The document keeps its full resource ID in the spec; the object name is a
/// digest of the normalized ID because most IDs are not valid Kubernetes
/// object names.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "ucp.radapp.io",
    version = "v1alpha1",
    kind = "UcpResource",
    plural = "ucpresources",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct UcpResourceSpec {
    pub resource_id: String,
    pub document: serde_json::Value,
}

fn object_name(prefix: &str, key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    format!("{prefix}-{}", &hex[..40])
}

pub struct KubernetesStateStore {
    api: Api<UcpResource>,
    backoff: BackoffPolicy,
}

impl KubernetesStateStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            backoff: BackoffPolicy::default(),
        }
    }

    /// `None` for objects whose recorded ID does not parse; those can only
    /// appear through out-of-band edits of the backing custom resource.
    fn entry_from(&self, object: &UcpResource) -> Option<Entry> {
        let id = ResourceId::parse(&object.spec.resource_id).ok()?;
        Some(Entry {
            id,
            data: object.spec.document.clone(),
            etag: Etag::new(object.resource_version().unwrap_or_default()),
        })
    }

    async fn fetch(&self, name: &str) -> Result<Option<UcpResource>, StoreError> {
        with_backoff(&self.backoff, StoreError::is_transient, || async {
            self.api.get_opt(name).await.context(KubernetesSnafu)
        })
        .await
    }
}

fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
}

#[async_trait]
impl StateStore for KubernetesStateStore {
    async fn get(&self, id: &ResourceId) -> Result<Option<Entry>, StoreError> {
        let name = object_name("ucp", &normalized_key(id));
        Ok(self
            .fetch(&name)
            .await?
            .as_ref()
            .and_then(|object| self.entry_from(object)))
    }

    async fn save(
        &self,
        id: &ResourceId,
        data: serde_json::Value,
        precondition: WritePrecondition,
    ) -> Result<Etag, StoreError> {
        let key = normalized_key(id);
        let name = object_name("ucp", &key);
        let existing = self.fetch(&name).await?;

        match (&precondition, &existing) {
            (WritePrecondition::MustNotExist, Some(_)) => {
                return Err(StoreError::AlreadyExists { id: id.clone() });
            }
            (WritePrecondition::IfMatch(_), None) => {
                return Err(StoreError::NotFound { id: id.clone() });
            }
            (WritePrecondition::IfMatch(etag), Some(object))
                if object.resource_version().as_deref() != Some(etag.as_str()) =>
            {
                return Err(StoreError::ConcurrencyConflict { id: id.clone() });
            }
            _ => {}
        }

        let mut object = UcpResource::new(
            &name,
            UcpResourceSpec {
                resource_id: id.to_string(),
                document: data,
            },
        );

        let saved = match existing {
            None => self.api.create(&PostParams::default(), &object).await,
            Some(current) => {
                // Replace against the observed version so a concurrent
                // writer surfaces as a 409 from the API server.
                object.metadata.resource_version = current.resource_version();
                self.api.replace(&name, &PostParams::default(), &object).await
            }
        }
        .map_err(|error| {
            if is_conflict(&error) {
                StoreError::ConcurrencyConflict { id: id.clone() }
            } else {
                StoreError::Kubernetes { source: error }
            }
        })?;

        Ok(Etag::new(saved.resource_version().unwrap_or_default()))
    }

    async fn delete(
        &self,
        id: &ResourceId,
        precondition: WritePrecondition,
    ) -> Result<(), StoreError> {
        let name = object_name("ucp", &normalized_key(id));
        let existing = self
            .fetch(&name)
            .await?
            .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;

        if let WritePrecondition::IfMatch(etag) = &precondition {
            if existing.resource_version().as_deref() != Some(etag.as_str()) {
                return Err(StoreError::ConcurrencyConflict { id: id.clone() });
            }
        }

        self.api
            .delete(&name, &DeleteParams::default())
            .await
            .map_err(|error| {
                if is_conflict(&error) {
                    StoreError::ConcurrencyConflict { id: id.clone() }
                } else {
                    StoreError::Kubernetes { source: error }
                }
            })?;
        Ok(())
    }

    async fn query(&self, query: Query) -> Result<Page, StoreError> {
        let scope = normalized_scope(&query.root_scope);
        let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        let type_filter = query.resource_type.as_deref().map(str::to_ascii_lowercase);

        let list = with_backoff(&self.backoff, StoreError::is_transient, || async {
            self.api
                .list(&ListParams::default())
                .await
                .context(KubernetesSnafu)
        })
        .await?;

        // The CRD driver filters and pages client-side: document IDs are not
        // expressible as label selectors.
        let mut matches: Vec<(String, Entry)> = Vec::new();
        for object in &list.items {
            let Some(entry) = self.entry_from(object) else {
                continue;
            };
            let key = normalized_key(&entry.id);
            let in_scope = match key.strip_prefix(&scope) {
                Some(rest) => query.scope_recursive || rest.starts_with("/providers/"),
                None => false,
            };
            if !in_scope {
                continue;
            }
            if let Some(filter) = &type_filter {
                let qualified = entry.id.qualified_type().unwrap_or_default();
                if !qualified.eq_ignore_ascii_case(filter) {
                    continue;
                }
            }
            matches.push((key, entry));
        }
        matches.sort_by(|a, b| a.0.cmp(&b.0));

        let start = match &query.continuation {
            Some(token) => matches
                .iter()
                .position(|(key, _)| key > token)
                .unwrap_or(matches.len()),
            None => 0,
        };
        let end = start.saturating_add(limit).min(matches.len());
        let continuation =
            (end > start && end < matches.len()).then(|| matches[end - 1].0.clone());

        Ok(Page {
            items: matches[start..end].iter().map(|(_, e)| e.clone()).collect(),
            continuation,
        })
    }
}

/// Secrets for one scope live in a single `v1/Secret` object; the secret
/// names become data keys.
pub struct KubernetesSecretStore {
    api: Api<Secret>,
}

impl KubernetesSecretStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    fn secret_name(scope: &SecretScope) -> String {
        object_name("ucp-secrets", &normalized_key(scope.id()))
    }
}

#[async_trait]
impl SecretStore for KubernetesSecretStore {
    async fn get_secret(
        &self,
        scope: &SecretScope,
        name: &str,
    ) -> Result<Vec<u8>, SecretStoreError> {
        let object = self
            .api
            .get_opt(&Self::secret_name(scope))
            .await
            .context(secrets::KubernetesSnafu)?;
        object
            .and_then(|secret| secret.data.unwrap_or_default().remove(name))
            .map(|ByteString(bytes)| bytes)
            .ok_or_else(|| SecretStoreError::NotFound {
                scope: scope.id().clone(),
                name: name.to_owned(),
            })
    }

    async fn put_secret(
        &self,
        scope: &SecretScope,
        name: &str,
        value: &[u8],
    ) -> Result<(), SecretStoreError> {
        secrets::validate_name(name)?;
        let secret_name = Self::secret_name(scope);
        let existing = self
            .api
            .get_opt(&secret_name)
            .await
            .context(secrets::KubernetesSnafu)?;

        match existing {
            Some(mut secret) => {
                secret
                    .data
                    .get_or_insert_with(BTreeMap::new)
                    .insert(name.to_owned(), ByteString(value.to_vec()));
                self.api
                    .replace(&secret_name, &PostParams::default(), &secret)
                    .await
                    .context(secrets::KubernetesSnafu)?;
            }
            None => {
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(secret_name.clone()),
                        ..ObjectMeta::default()
                    },
                    data: Some(BTreeMap::from([(
                        name.to_owned(),
                        ByteString(value.to_vec()),
                    )])),
                    ..Secret::default()
                };
                self.api
                    .create(&PostParams::default(), &secret)
                    .await
                    .context(secrets::KubernetesSnafu)?;
            }
        }
        Ok(())
    }

    async fn delete_secret(
        &self,
        scope: &SecretScope,
        name: &str,
    ) -> Result<(), SecretStoreError> {
        let secret_name = Self::secret_name(scope);
        let Some(mut secret) = self
            .api
            .get_opt(&secret_name)
            .await
            .context(secrets::KubernetesSnafu)?
        else {
            return Ok(());
        };

        let remaining = {
            let data = secret.data.get_or_insert_with(BTreeMap::new);
            data.remove(name);
            data.len()
        };

        if remaining == 0 {
            self.api
                .delete(&secret_name, &DeleteParams::default())
                .await
                .context(secrets::KubernetesSnafu)?;
        } else {
            self.api
                .replace(&secret_name, &PostParams::default(), &secret)
                .await
                .context(secrets::KubernetesSnafu)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names_are_deterministic_and_dns_safe() {
        let id: ResourceId =
            "/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/containers/web"
                .parse()
                .unwrap();
        let name = object_name("ucp", &normalized_key(&id));
        assert_eq!(name, object_name("ucp", &normalized_key(&id)));
        assert!(name.len() <= 63);
        assert!(
            name.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        );

        // Folded ID variants map to the same object.
        let folded: ResourceId =
            "/planes/radius/local/resourcegroups/rg1/providers/applications.core/CONTAINERS/web"
                .parse()
                .unwrap();
        assert_eq!(name, object_name("ucp", &normalized_key(&folded)));
    }
}
