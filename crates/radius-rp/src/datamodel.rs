//! Internal data models of the built-in resource types.
//!
//! These are the single source of truth the async controllers operate on;
//! versioned wire models in [`crate::api`] convert into and out of them.

use std::collections::BTreeMap;

use radius_recipes::{RecipeDefinition, context::CloudScopes};
use radius_resource::{Connection, ResourceId};
use serde::{Deserialize, Serialize};

/// Compute platform an environment deploys workloads to. Kubernetes is the
/// only kind the control plane currently runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesCompute {
    pub kind: String,
    pub namespace: String,
}

impl Default for KubernetesCompute {
    fn default() -> Self {
        Self {
            kind: "kubernetes".to_owned(),
            namespace: "default".to_owned(),
        }
    }
}

/// `Applications.Core/environments` properties: the deployment target and
/// the recipe catalog, keyed `resourceType → recipeName → definition`.
///
/// Serialization stays compatible with the view the recipe engine reads
/// (`radius_recipes::engine::EnvironmentView`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentProperties {
    #[serde(default)]
    pub compute: KubernetesCompute,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub recipes: BTreeMap<String, BTreeMap<String, RecipeDefinition>>,
    #[serde(default, skip_serializing_if = "is_default_scopes")]
    pub providers: CloudScopes,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub simulated: bool,
}

fn is_default_scopes(scopes: &CloudScopes) -> bool {
    *scopes == CloudScopes::default()
}

/// `Applications.Core/applications` properties.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationProperties {
    pub environment: ResourceId,
}

/// One exposed container port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPortSpec {
    pub container_port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// The workload half of a container resource.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ports: BTreeMap<String, ContainerPortSpec>,
}

/// `Applications.Core/containers` properties.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerProperties {
    pub application: ResourceId,
    pub container: ContainerSpec,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub connections: BTreeMap<String, Connection>,
}

/// One routing rule of a gateway.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRoute {
    pub path: String,
    /// A route resource ID or a literal `http://service:port` destination.
    pub destination: String,
}

/// `Applications.Core/gateways` properties.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayProperties {
    pub application: ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub routes: Vec<GatewayRoute>,
}

/// `Applications.Core/httpRoutes` properties. Routes complete synchronously:
/// their computed values (host, port, scheme, url) are pure functions of the
/// declaration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteProperties {
    pub application: ResourceId,
    #[serde(default = "default_http_port")]
    pub port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
}

fn default_http_port() -> i32 {
    80
}

/// `Applications.Core/volumes` properties. Only persistent volumes backed by
/// the environment's platform are modeled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeProperties {
    pub application: ResourceId,
    pub kind: String,
}

/// One entry of a secret store. `value` is write-only: it is moved into the
/// secret store by the controller and never persisted on the document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretValueSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Encoding of `value`: `raw` (default) or `base64`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

/// `Applications.Core/secretStores` properties.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretStoreProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<ResourceId>,
    #[serde(rename = "type", default = "default_secret_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, SecretValueSpec>,
}

fn default_secret_kind() -> String {
    "generic".to_owned()
}

/// How a portable resource gets its backing infrastructure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceProvisioning {
    /// A recipe registered in the environment materializes it.
    #[default]
    Recipe,
    /// The user supplies values and secrets by hand.
    Manual,
}

/// A resource's selection of a recipe from the environment catalog.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeBinding {
    /// Recipe name; empty selects `default`.
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

macro_rules! portable_properties {
    ($(#[$doc:meta])* $name:ident { $($(#[$fdoc:meta])* $field:ident : $ty:ty),* $(,)? }) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            pub environment: ResourceId,
            #[serde(default, skip_serializing_if = "Option::is_none")]
            pub application: Option<ResourceId>,
            #[serde(default)]
            pub recipe: RecipeBinding,
            #[serde(default, skip_serializing_if = "is_default_provisioning")]
            pub resource_provisioning: ResourceProvisioning,
            $(
                $(#[$fdoc])*
                #[serde(default, skip_serializing_if = "Option::is_none")]
                pub $field: Option<$ty>,
            )*
        }
    };
}

fn is_default_provisioning(provisioning: &ResourceProvisioning) -> bool {
    *provisioning == ResourceProvisioning::Recipe
}

portable_properties! {
    /// `Applications.Datastores/redisCaches` properties.
    RedisCacheProperties {
        host: String,
        port: i32,
        username: String,
        tls: bool,
    }
}

portable_properties! {
    /// `Applications.Datastores/mongoDatabases` properties.
    MongoDatabaseProperties {
        host: String,
        port: i32,
        database: String,
        username: String,
    }
}

portable_properties! {
    /// `Applications.Datastores/sqlDatabases` properties.
    SqlDatabaseProperties {
        server: String,
        port: i32,
        database: String,
        username: String,
    }
}

portable_properties! {
    /// `Applications.Messaging/rabbitMQQueues` properties.
    RabbitMQQueueProperties {
        queue: String,
        host: String,
        port: i32,
        vhost: String,
        username: String,
        tls: bool,
    }
}

portable_properties! {
    /// `Applications.Dapr/stateStores` properties.
    DaprStateStoreProperties {
        component_name: String,
        version: String,
    }
}

portable_properties! {
    /// `Applications.Dapr/pubSubBrokers` properties.
    DaprPubSubBrokerProperties {
        component_name: String,
        topic: String,
        version: String,
    }
}

/// `Applications.Core/extenders` properties: a recipe-backed resource with a
/// free-form shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtenderProperties {
    pub environment: ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<ResourceId>,
    #[serde(default)]
    pub recipe: RecipeBinding,
    #[serde(default, skip_serializing_if = "is_default_provisioning")]
    pub resource_provisioning: ResourceProvisioning,
    #[serde(flatten)]
    pub additional_properties: BTreeMap<String, serde_json::Value>,
}
