use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identity of a concrete infrastructure artifact produced by a recipe or a
/// renderer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputResourceIdentity {
    /// Provider family the artifact lives in, e.g. `kubernetes` or `azure`.
    pub provider: String,
    /// API version the artifact was created with, where the provider has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Provider-native identifier, e.g. a Kubernetes `namespace/name` pair or
    /// an ARM resource ID.
    pub id: String,
}

/// An infrastructure artifact owned (or referenced) by a Radius resource.
///
/// A parent resource owns the lifecycle of its radius-managed outputs:
/// deleting the parent deletes them. Outputs with `radius_managed == false`
/// are references and are never mutated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputResource {
    /// Stable identifier of the output within its parent resource, e.g.
    /// `Deployment` or `recipe/0`.
    pub local_id: String,
    pub identity: OutputResourceIdentity,
    pub radius_managed: bool,
    /// Provider-specific metadata the driver wants to keep around.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl OutputResource {
    pub fn kubernetes(local_id: &str, api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            local_id: local_id.to_owned(),
            identity: OutputResourceIdentity {
                provider: "kubernetes".to_owned(),
                api_version: Some(api_version.to_owned()),
                id: format!("{kind}/{namespace}/{name}"),
            },
            radius_managed: true,
            metadata: BTreeMap::new(),
        }
    }
}
