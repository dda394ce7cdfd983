//! The read-only context a recipe template receives.

use radius_resource::ResourceId;
use serde::{Deserialize, Serialize};

/// Identity block for one participant of the invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextIdentity {
    pub id: ResourceId,
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
}

impl ContextIdentity {
    pub fn from_id(id: &ResourceId) -> Self {
        Self {
            id: id.clone(),
            name: id.name().unwrap_or_default().to_owned(),
            resource_type: id.qualified_type(),
        }
    }
}

/// Kubernetes runtime assignment for the invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesRuntime {
    /// Namespace the resource's workload objects land in.
    pub namespace: String,
    /// Namespace of the environment itself.
    pub environment_namespace: String,
}

/// Optional cloud scopes configured on the environment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudScopes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureScope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsScope>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureScope {
    /// Fully qualified resource group scope, e.g.
    /// `/subscriptions/{guid}/resourceGroups/{name}`.
    pub scope: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsScope {
    /// Fully qualified scope, e.g. `/planes/aws/aws/accounts/{id}/regions/{region}`.
    pub scope: String,
}

/// Everything a template may read about its invocation. Serialized and
/// passed to the template as the `context` parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeContext {
    pub resource: ContextIdentity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<ContextIdentity>,
    pub environment: ContextIdentity,
    pub runtime: KubernetesRuntime,
    #[serde(default, skip_serializing_if = "is_default_scopes")]
    pub cloud: CloudScopes,
}

fn is_default_scopes(scopes: &CloudScopes) -> bool {
    *scopes == CloudScopes::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_serializes_for_templates() {
        let context = RecipeContext {
            resource: ContextIdentity::from_id(
                &"/planes/radius/local/resourceGroups/rg1/providers/Applications.Datastores/redisCaches/cache"
                    .parse()
                    .unwrap(),
            ),
            application: None,
            environment: ContextIdentity::from_id(
                &"/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/environments/env"
                    .parse()
                    .unwrap(),
            ),
            runtime: KubernetesRuntime {
                namespace: "default-myapp".into(),
                environment_namespace: "default".into(),
            },
            cloud: CloudScopes::default(),
        };

        let value = serde_json::to_value(&context).unwrap();
        assert_eq!(value["resource"]["name"], "cache");
        assert_eq!(
            value["resource"]["type"],
            "Applications.Datastores/redisCaches"
        );
        assert_eq!(value["runtime"]["namespace"], "default-myapp");
        assert!(value.get("cloud").is_none());
        assert!(value.get("application").is_none());
    }
}
