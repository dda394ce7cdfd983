//! Storage for resource documents and scoped secrets.
//!
//! Both stores are small trait contracts with pluggable drivers. The state
//! store holds JSON resource documents keyed by [`ResourceId`] with
//! ETag-based optimistic concurrency; the secret store holds opaque bytes
//! scoped to an environment, application or resource and is deliberately
//! invisible to queries.
//!
//! Drivers: an embedded single-node store (the default for local and test
//! runs) and a Kubernetes driver persisting documents as custom resources,
//! with the API server's resource version as the ETag.

use std::fmt;

use async_trait::async_trait;
use radius_resource::ResourceId;
use serde::{Serialize, de::DeserializeOwned};
use snafu::{ResultExt, Snafu};

pub mod kubernetes;
pub mod memory;
pub mod retry;
pub mod secrets;

pub use kubernetes::{KubernetesSecretStore, KubernetesStateStore};
pub use memory::{InMemorySecretStore, InMemoryStateStore};
pub use secrets::{SecretScope, SecretStore, SecretStoreError};

/// Default page size for queries that do not ask for one.
pub const DEFAULT_QUERY_LIMIT: usize = 20;

type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("resource {id} was not found"))]
    NotFound { id: ResourceId },

    #[snafu(display("write to {id} lost against a concurrent writer"))]
    ConcurrencyConflict { id: ResourceId },

    #[snafu(display("resource {id} already exists"))]
    AlreadyExists { id: ResourceId },

    #[snafu(display("invalid continuation token"))]
    InvalidContinuation,

    #[snafu(display("failed to serialize document for {id}"))]
    SerializeDocument {
        source: serde_json::Error,
        id: ResourceId,
    },

    #[snafu(display("failed to deserialize document for {id}"))]
    DeserializeDocument {
        source: serde_json::Error,
        id: ResourceId,
    },

    #[snafu(display("kubernetes request failed"))]
    Kubernetes { source: kube::Error },
}

impl StoreError {
    /// Transient errors are worth retrying with backoff; everything else is
    /// either a caller bug or an expected precondition failure.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Kubernetes { source } => match source {
                kube::Error::Api(response) => {
                    response.code == 429 || response.code == 500 || response.code == 503
                }
                kube::Error::HyperError(_) | kube::Error::Service(_) => true,
                _ => false,
            },
            _ => false,
        }
    }
}

/// Opaque version token for optimistic concurrency. Drivers guarantee a
/// successful write observes a token different from (and for ordered
/// drivers, greater than) every earlier one for the same document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Etag(String);

impl Etag {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Precondition attached to a write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Last writer wins.
    #[default]
    None,
    /// The document must not exist yet (`If-None-Match: *`).
    MustNotExist,
    /// The document must currently carry exactly this ETag.
    IfMatch(Etag),
}

/// A stored document together with its version.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub id: ResourceId,
    pub data: serde_json::Value,
    pub etag: Etag,
}

impl Entry {
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).context(DeserializeDocumentSnafu {
            id: self.id.clone(),
        })
    }
}

/// A scope-and-type filter over stored documents.
#[derive(Clone, Debug, Default)]
pub struct Query {
    /// Root scope prefix, e.g. `/planes/radius/local/resourceGroups/rg1`.
    pub root_scope: String,
    /// Also match resources in nested scopes below `root_scope`.
    pub scope_recursive: bool,
    /// Fully qualified type filter, compared case-insensitively.
    pub resource_type: Option<String>,
    /// Continuation token from a previous page.
    pub continuation: Option<String>,
    /// Maximum number of items to return; defaults to [`DEFAULT_QUERY_LIMIT`].
    pub limit: Option<usize>,
}

impl Query {
    pub fn scoped(root_scope: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            root_scope: root_scope.into(),
            resource_type: Some(resource_type.into()),
            ..Self::default()
        }
    }
}

/// One page of query results. `continuation` is set when more results exist;
/// feeding it back into the same query resumes after the last item.
#[derive(Clone, Debug, Default)]
pub struct Page {
    pub items: Vec<Entry>,
    pub continuation: Option<String>,
}

/// Key/value store over resource documents with optimistic concurrency.
///
/// `save` either succeeds and returns the advanced ETag or fails with
/// [`StoreError::ConcurrencyConflict`] leaving the document unchanged.
/// `get` is read-committed. `query` reflects at least every write committed
/// before the call.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, id: &ResourceId) -> Result<Option<Entry>>;

    async fn save(
        &self,
        id: &ResourceId,
        data: serde_json::Value,
        precondition: WritePrecondition,
    ) -> Result<Etag>;

    async fn delete(&self, id: &ResourceId, precondition: WritePrecondition) -> Result<()>;

    async fn query(&self, query: Query) -> Result<Page>;
}

/// Typed convenience layer over [`StateStore`].
#[async_trait]
pub trait StateStoreExt: StateStore {
    async fn get_typed<T: DeserializeOwned + Send>(
        &self,
        id: &ResourceId,
    ) -> Result<Option<(T, Etag)>> {
        match self.get(id).await? {
            Some(entry) => Ok(Some((entry.to_typed()?, entry.etag))),
            None => Ok(None),
        }
    }

    async fn save_typed<T: Serialize + Sync>(
        &self,
        id: &ResourceId,
        value: &T,
        precondition: WritePrecondition,
    ) -> Result<Etag> {
        let data = serde_json::to_value(value).context(SerializeDocumentSnafu { id: id.clone() })?;
        self.save(id, data, precondition).await
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}

/// Normalized storage key for an ID: plane, scope keys, namespace and types
/// are folded to lower case, names keep their case. Two IDs that compare
/// equal produce the same key.
pub(crate) fn normalized_key(id: &ResourceId) -> String {
    let mut key = String::new();
    key.push_str(&format!(
        "/planes/{}/{}",
        id.plane_kind().to_ascii_lowercase(),
        id.plane_name()
    ));
    for scope in id.scopes() {
        key.push_str(&format!("/{}/{}", scope.key.to_ascii_lowercase(), scope.name));
    }
    if let Some(namespace) = id.provider_namespace() {
        key.push_str(&format!("/providers/{}", namespace.to_ascii_lowercase()));
        for segment in id.type_segments() {
            key.push_str(&format!("/{}", segment.name.to_ascii_lowercase()));
            if let Some(instance) = &segment.instance {
                key.push_str(&format!("/{instance}"));
            }
        }
    }
    key
}

/// Normalizes a caller-supplied root scope the same way [`normalized_key`]
/// normalizes IDs, so prefix matching lines up.
pub(crate) fn normalized_scope(scope: &str) -> String {
    match ResourceId::parse(scope) {
        Ok(id) => normalized_key(&id),
        // Scope strings that fail to parse only ever match nothing.
        Err(_) => scope.to_ascii_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_key_folds_types_not_names() {
        let a: ResourceId =
            "/planes/Radius/local/resourceGroups/rg1/providers/Applications.Core/Containers/Web"
                .parse()
                .unwrap();
        assert_eq!(
            normalized_key(&a),
            "/planes/radius/local/resourcegroups/rg1/providers/applications.core/containers/Web"
        );
    }

    #[test]
    fn normalized_scope_matches_key_prefix() {
        let id: ResourceId =
            "/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/containers/web"
                .parse()
                .unwrap();
        let scope = normalized_scope("/planes/radius/local/resourceGroups/rg1");
        assert!(normalized_key(&id).starts_with(&scope));
    }
}
