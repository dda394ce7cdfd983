//! Scoped secret storage.
//!
//! Secrets are opaque byte blobs addressed by `(scope, name)`. Scopes mirror
//! the ownership hierarchy: an environment, an application or a single
//! resource. Secret material never flows through the state store and is
//! never returned by queries.

use async_trait::async_trait;
use radius_resource::ResourceId;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SecretStoreError {
    #[snafu(display("secret {name:?} was not found in scope {scope}"))]
    NotFound { scope: ResourceId, name: String },

    #[snafu(display("secret name {name:?} is not valid"))]
    InvalidName { name: String },

    #[snafu(display("kubernetes request failed"))]
    Kubernetes { source: kube::Error },
}

/// The ownership level a secret is attached to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SecretScope {
    Environment(ResourceId),
    Application(ResourceId),
    Resource(ResourceId),
}

impl SecretScope {
    pub fn id(&self) -> &ResourceId {
        match self {
            Self::Environment(id) | Self::Application(id) | Self::Resource(id) => id,
        }
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(
        &self,
        scope: &SecretScope,
        name: &str,
    ) -> Result<Vec<u8>, SecretStoreError>;

    async fn put_secret(
        &self,
        scope: &SecretScope,
        name: &str,
        value: &[u8],
    ) -> Result<(), SecretStoreError>;

    async fn delete_secret(&self, scope: &SecretScope, name: &str)
    -> Result<(), SecretStoreError>;
}

/// Validates a secret name: the same charset Kubernetes accepts for secret
/// data keys, so every driver can store any accepted name.
pub(crate) fn validate_name(name: &str) -> Result<(), SecretStoreError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        InvalidNameSnafu { name }.fail()
    }
}
