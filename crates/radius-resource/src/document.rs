//! The persisted resource envelope shared by every resource type.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    connection::SecretReference, id::ResourceId, output::OutputResource, state::ProvisioningState,
    system_data::SystemData,
};

/// Version bookkeeping the control plane keeps alongside user data: which
/// API version last wrote the document. Conversion back out always goes
/// through the converter registry, so any supported version can read a
/// document written by any other.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_api_version: Option<String>,
    pub updated_api_version: String,
    /// Resource types without a backing worker complete synchronously; the
    /// flag is recorded so the status endpoints can answer for them too.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synchronous: bool,
    /// The async operation that last committed this document. Workers write
    /// the resource before the operation status; a crash between the two is
    /// recovered by matching this field against the in-flight operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub async_operation_id: Option<uuid::Uuid>,
}

/// Observed state attached to a resource by the back-end: the infrastructure
/// the resource materialized into and the values it exposes to consumers.
///
/// Secret material is never stored here; only [`SecretReference`]s are.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_resources: Vec<OutputResource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub computed_values: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, SecretReference>,
}

/// The envelope every resource document is persisted in.
///
/// `P` is the type-specific internal properties model. The front-end owns
/// this document on the write path, the worker on the reconcile path;
/// mutual exclusion is by resource ID.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEnvelope<P> {
    pub id: ResourceId,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub location: String,
    pub provisioning_state: ProvisioningState,
    pub system_data: SystemData,
    pub internal_metadata: InternalMetadata,
    #[serde(default, skip_serializing_if = "is_default_status")]
    pub status: ResourceStatus,
    pub properties: P,
}

fn is_default_status(status: &ResourceStatus) -> bool {
    *status == ResourceStatus::default()
}

impl<P> ResourceEnvelope<P> {
    /// Re-wraps the envelope around different properties, keeping all
    /// server-owned bookkeeping.
    pub fn map<Q>(self, f: impl FnOnce(P) -> Q) -> ResourceEnvelope<Q> {
        ResourceEnvelope {
            id: self.id,
            name: self.name,
            resource_type: self.resource_type,
            location: self.location,
            provisioning_state: self.provisioning_state,
            system_data: self.system_data,
            internal_metadata: self.internal_metadata,
            status: self.status,
            properties: f(self.properties),
        }
    }
}

impl ResourceEnvelope<serde_json::Value> {
    /// Downcasts the untyped envelope the framework works with into the
    /// typed envelope a provider controller works with.
    pub fn into_typed<P: DeserializeOwned>(
        self,
    ) -> Result<ResourceEnvelope<P>, serde_json::Error> {
        let properties = serde_json::from_value(self.properties.clone())?;
        Ok(self.map(|_| properties))
    }
}

impl<P: Serialize> ResourceEnvelope<P> {
    /// Upcasts a typed envelope into the untyped form stores and the
    /// framework exchange.
    pub fn into_untyped(self) -> Result<ResourceEnvelope<serde_json::Value>, serde_json::Error> {
        let properties = serde_json::to_value(&self.properties)?;
        Ok(self.map(|_| properties))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct CacheProperties {
        host: String,
        port: u16,
    }

    fn envelope() -> ResourceEnvelope<CacheProperties> {
        ResourceEnvelope {
            id: "/planes/radius/local/resourceGroups/rg1/providers/Applications.Datastores/redisCaches/cache"
                .parse()
                .unwrap(),
            name: "cache".into(),
            resource_type: "Applications.Datastores/redisCaches".into(),
            location: "global".into(),
            provisioning_state: ProvisioningState::Succeeded,
            system_data: SystemData::default(),
            internal_metadata: InternalMetadata {
                created_api_version: Some("2023-10-01-preview".into()),
                updated_api_version: "2023-10-01-preview".into(),
                ..InternalMetadata::default()
            },
            status: ResourceStatus::default(),
            properties: CacheProperties {
                host: "redis.internal".into(),
                port: 6379,
            },
        }
    }

    #[test]
    fn typed_untyped_roundtrip() {
        let typed = envelope();
        let untyped = typed.clone().into_untyped().unwrap();
        assert_eq!(untyped.properties, json!({"host": "redis.internal", "port": 6379}));

        let back: ResourceEnvelope<CacheProperties> = untyped.into_typed().unwrap();
        assert_eq!(back, typed);
    }

    #[test]
    fn envelope_wire_shape() {
        let value = serde_json::to_value(envelope()).unwrap();
        assert_eq!(value["type"], "Applications.Datastores/redisCaches");
        assert_eq!(value["provisioningState"], "Succeeded");
        assert_eq!(value["internalMetadata"]["updatedApiVersion"], "2023-10-01-preview");
        // Empty status is elided entirely.
        assert!(value.get("status").is_none());
    }
}
