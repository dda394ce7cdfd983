//! The embedded single-node drivers.
//!
//! Documents live in an ordered in-process map behind an async lock; ETags
//! are a per-document write counter, so they are strictly increasing. This
//! is the driver behind `storageProvider: embedded` and every test.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use radius_resource::ResourceId;
use tokio::sync::RwLock;

use crate::{
    DEFAULT_QUERY_LIMIT, Entry, Etag, Page, Query, StateStore, StoreError, WritePrecondition,
    normalized_key, normalized_scope,
    secrets::{self, SecretScope, SecretStore, SecretStoreError},
};

#[derive(Clone, Debug)]
struct Stored {
    id: ResourceId,
    data: serde_json::Value,
    version: u64,
}

impl Stored {
    fn etag(&self) -> Etag {
        Etag::new(self.version.to_string())
    }

    fn entry(&self) -> Entry {
        Entry {
            id: self.id.clone(),
            data: self.data.clone(),
            etag: self.etag(),
        }
    }
}

#[derive(Default)]
pub struct InMemoryStateStore {
    // Keyed by the normalized ID so lookups fold case the same way ID
    // comparison does. BTreeMap keeps scope prefixes contiguous for queries.
    documents: RwLock<BTreeMap<String, Stored>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, id: &ResourceId) -> Result<Option<Entry>, StoreError> {
        let documents = self.documents.read().await;
        Ok(documents.get(&normalized_key(id)).map(Stored::entry))
    }

    async fn save(
        &self,
        id: &ResourceId,
        data: serde_json::Value,
        precondition: WritePrecondition,
    ) -> Result<Etag, StoreError> {
        let mut documents = self.documents.write().await;
        let key = normalized_key(id);
        let existing = documents.get(&key);

        let version = match (&precondition, existing) {
            (WritePrecondition::MustNotExist, Some(_)) => {
                return Err(StoreError::AlreadyExists { id: id.clone() });
            }
            (WritePrecondition::IfMatch(_), None) => {
                return Err(StoreError::NotFound { id: id.clone() });
            }
            (WritePrecondition::IfMatch(etag), Some(stored)) if stored.etag() != *etag => {
                return Err(StoreError::ConcurrencyConflict { id: id.clone() });
            }
            (_, existing) => existing.map_or(1, |stored| stored.version + 1),
        };

        let stored = Stored {
            id: id.clone(),
            data,
            version,
        };
        let etag = stored.etag();
        documents.insert(key, stored);
        Ok(etag)
    }

    async fn delete(
        &self,
        id: &ResourceId,
        precondition: WritePrecondition,
    ) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        let key = normalized_key(id);

        match (&precondition, documents.get(&key)) {
            (_, None) => return Err(StoreError::NotFound { id: id.clone() }),
            (WritePrecondition::IfMatch(etag), Some(stored)) if stored.etag() != *etag => {
                return Err(StoreError::ConcurrencyConflict { id: id.clone() });
            }
            _ => {}
        }

        documents.remove(&key);
        Ok(())
    }

    async fn query(&self, query: Query) -> Result<Page, StoreError> {
        let documents = self.documents.read().await;
        let scope = normalized_scope(&query.root_scope);
        let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT);

        let type_filter = query
            .resource_type
            .as_deref()
            .map(str::to_ascii_lowercase);

        let start: std::ops::Bound<String> = match &query.continuation {
            Some(token) => std::ops::Bound::Excluded(token.clone()),
            None => std::ops::Bound::Unbounded,
        };

        let mut items = Vec::new();
        let mut last_key: Option<&String> = None;
        let mut continuation = None;

        for (key, stored) in documents.range((start, std::ops::Bound::Unbounded)) {
            if !matches_scope(&scope, key, query.scope_recursive) {
                continue;
            }
            if let Some(type_filter) = &type_filter {
                let qualified = stored.id.qualified_type().unwrap_or_default();
                if !qualified.eq_ignore_ascii_case(type_filter) {
                    continue;
                }
            }

            if items.len() == limit {
                // More matches exist; resume after the last returned item.
                continuation = last_key.cloned();
                break;
            }
            items.push(stored.entry());
            last_key = Some(key);
        }

        Ok(Page {
            items,
            continuation,
        })
    }
}

/// A key matches a scope non-recursively when the document sits directly in
/// that scope: `{scope}/providers/{...}` with no further scope segments.
fn matches_scope(scope: &str, key: &str, recursive: bool) -> bool {
    let Some(rest) = key.strip_prefix(scope) else {
        return false;
    };
    if recursive {
        return true;
    }
    rest.starts_with("/providers/")
}

#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(scope: &SecretScope, name: &str) -> (String, String) {
        (normalized_key(scope.id()), name.to_owned())
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get_secret(
        &self,
        scope: &SecretScope,
        name: &str,
    ) -> Result<Vec<u8>, SecretStoreError> {
        let secrets = self.secrets.read().await;
        secrets
            .get(&Self::key(scope, name))
            .cloned()
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
        let mut secrets = self.secrets.write().await;
        secrets.insert(Self::key(scope, name), value.to_vec());
        Ok(())
    }

    async fn delete_secret(
        &self,
        scope: &SecretScope,
        name: &str,
    ) -> Result<(), SecretStoreError> {
        let mut secrets = self.secrets.write().await;
        secrets.remove(&Self::key(scope, name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::StateStoreExt;

    fn id(raw: &str) -> ResourceId {
        raw.parse().unwrap()
    }

    fn container(name: &str) -> ResourceId {
        id(&format!(
            "/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/containers/{name}"
        ))
    }

    #[tokio::test]
    async fn save_get_roundtrip_with_increasing_etag() {
        let store = InMemoryStateStore::new();
        let id = container("web");

        let first = store
            .save(&id, json!({"a": 1}), WritePrecondition::None)
            .await
            .unwrap();
        let second = store
            .save(&id, json!({"a": 2}), WritePrecondition::None)
            .await
            .unwrap();
        assert!(second > first);

        let entry = store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.data, json!({"a": 2}));
        assert_eq!(entry.etag, second);
    }

    #[tokio::test]
    async fn lookup_folds_type_case() {
        let store = InMemoryStateStore::new();
        store
            .save(&container("web"), json!({}), WritePrecondition::None)
            .await
            .unwrap();

        let folded = id(
            "/planes/radius/local/resourcegroups/rg1/providers/applications.core/CONTAINERS/web",
        );
        assert!(store.get(&folded).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn if_match_conflict_leaves_document_unchanged() {
        let store = InMemoryStateStore::new();
        let id = container("web");
        let etag = store
            .save(&id, json!({"v": 1}), WritePrecondition::None)
            .await
            .unwrap();

        // Winner advances the etag.
        store
            .save(&id, json!({"v": 2}), WritePrecondition::IfMatch(etag.clone()))
            .await
            .unwrap();

        // Loser observes a conflict and no change.
        let result = store
            .save(&id, json!({"v": 3}), WritePrecondition::IfMatch(etag))
            .await;
        assert!(matches!(result, Err(StoreError::ConcurrencyConflict { .. })));
        let entry = store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.data, json!({"v": 2}));
    }

    #[tokio::test]
    async fn must_not_exist() {
        let store = InMemoryStateStore::new();
        let id = container("web");
        store
            .save(&id, json!({}), WritePrecondition::MustNotExist)
            .await
            .unwrap();
        let result = store
            .save(&id, json!({}), WritePrecondition::MustNotExist)
            .await;
        assert!(matches!(result, Err(StoreError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn query_filters_scope_and_type_with_paging() {
        let store = InMemoryStateStore::new();
        for name in ["a", "b", "c"] {
            store
                .save(&container(name), json!({}), WritePrecondition::None)
                .await
                .unwrap();
        }
        // Different type in the same scope.
        store
            .save(
                &id("/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/gateways/gw"),
                json!({}),
                WritePrecondition::None,
            )
            .await
            .unwrap();
        // Same type in another scope.
        store
            .save(
                &id("/planes/radius/local/resourceGroups/rg2/providers/Applications.Core/containers/d"),
                json!({}),
                WritePrecondition::None,
            )
            .await
            .unwrap();

        let mut query = Query::scoped(
            "/planes/radius/local/resourceGroups/rg1",
            "Applications.Core/containers",
        );
        query.limit = Some(2);

        let first = store.query(query.clone()).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let continuation = first.continuation.clone().unwrap();

        query.continuation = Some(continuation);
        let second = store.query(query).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(second.continuation.is_none());

        let names: Vec<_> = first
            .items
            .iter()
            .chain(&second.items)
            .map(|entry| entry.id.name().unwrap().to_owned())
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn typed_helpers() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Doc {
            value: u32,
        }

        let store = InMemoryStateStore::new();
        let id = container("web");
        store
            .save_typed(&id, &Doc { value: 7 }, WritePrecondition::None)
            .await
            .unwrap();
        let (doc, _etag) = store.get_typed::<Doc>(&id).await.unwrap().unwrap();
        assert_eq!(doc, Doc { value: 7 });
    }

    #[tokio::test]
    async fn secrets_are_scoped() {
        let store = InMemorySecretStore::new();
        let env = SecretScope::Environment(id("/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/environments/env1"));
        let other = SecretScope::Environment(id("/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/environments/env2"));

        store.put_secret(&env, "password", b"hunter2").await.unwrap();
        assert_eq!(store.get_secret(&env, "password").await.unwrap(), b"hunter2");
        assert!(store.get_secret(&other, "password").await.is_err());

        store.delete_secret(&env, "password").await.unwrap();
        assert!(store.get_secret(&env, "password").await.is_err());
    }
}
