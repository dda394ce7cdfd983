//! The recipe engine.
//!
//! A recipe is a declarative template (Bicep or Terraform) owned by an
//! Environment that materializes a resource type into concrete
//! infrastructure. The engine resolves the recipe from the target
//! environment, assembles the per-invocation context, hands execution to the
//! driver and turns driver output into the observed status attached to the
//! resource document. Secret material produced by a recipe goes to the
//! secret store; only references land on the document.

use std::collections::{BTreeMap, BTreeSet};

use radius_resource::{OutputResource, ResourceId};
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio_util::sync::CancellationToken;

pub mod bicep;
pub mod context;
pub mod engine;
pub mod terraform;

pub use bicep::BicepDriver;
pub use context::RecipeContext;
pub use engine::{RecipeEngine, RecipeRequest};
pub use terraform::TerraformDriver;

#[derive(Debug, Snafu)]
pub enum RecipeError {
    #[snafu(display("environment {id} was not found"))]
    EnvironmentNotFound { id: ResourceId },

    #[snafu(display("environment {id} could not be read"))]
    EnvironmentUnreadable {
        source: radius_store::StoreError,
        id: ResourceId,
    },

    #[snafu(display("no recipe named {name:?} is registered for {resource_type} in the environment"))]
    RecipeNotFound {
        name: String,
        resource_type: String,
    },

    #[snafu(display("no driver is registered for template kind {kind:?}"))]
    DriverNotFound { kind: String },

    #[snafu(display("failed to fetch the template from {url}"))]
    FetchTemplate { source: reqwest::Error, url: String },

    #[snafu(display("deployment engine request failed"))]
    DeploymentEngine { source: reqwest::Error },

    #[snafu(display("the deployment failed: {message}"))]
    DeploymentFailed { message: String },

    #[snafu(display("terraform {phase} failed with {status}: {stderr}"))]
    TerraformFailed {
        phase: String,
        status: i32,
        stderr: String,
    },

    #[snafu(display("failed to run terraform: {message}"))]
    TerraformUnavailable { message: String },

    #[snafu(display("failed to prepare the terraform working directory"))]
    WorkingDirectory { source: std::io::Error },

    #[snafu(display("the recipe result has an invalid shape: {message}"))]
    InvalidResult { message: String },

    #[snafu(display("failed to persist recipe state"))]
    StateSecret {
        source: radius_store::SecretStoreError,
    },

    #[snafu(display("the operation was cancelled"))]
    Cancelled,
}

impl RecipeError {
    /// Transient errors should surface as a requeue, not a terminal failure.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DeploymentEngine { source } | Self::FetchTemplate { source, .. } => {
                source.is_timeout() || source.is_connect() || is_5xx(source)
            }
            Self::EnvironmentUnreadable { source, .. } => source.is_transient(),
            Self::StateSecret { .. } | Self::Cancelled => true,
            _ => false,
        }
    }
}

fn is_5xx(error: &reqwest::Error) -> bool {
    error.status().is_some_and(|status| status.is_server_error())
}

/// A recipe definition as registered in an environment's catalog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeDefinition {
    /// `bicep` or `terraform`.
    pub template_kind: String,
    /// Where the template lives: a URL to compiled Bicep JSON, or a
    /// Terraform module source.
    pub template_path: String,
    /// Module version for registry-sourced Terraform modules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_version: Option<String>,
    /// Operator-supplied defaults merged under user parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Parameter names the operator owns: the recipe value wins over the
    /// user value for these keys.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub authoritative: BTreeSet<String>,
}

/// What a driver hands back after a successful apply.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DriverOutput {
    pub resources: Vec<OutputResource>,
    pub values: BTreeMap<String, serde_json::Value>,
    /// Secret material; the engine moves it to the secret store.
    pub secrets: BTreeMap<String, String>,
}

/// One driver invocation.
pub struct DriverRequest<'a> {
    pub definition: &'a RecipeDefinition,
    pub context: &'a RecipeContext,
    /// Fully merged parameters (user + recipe, precedence applied).
    pub parameters: &'a BTreeMap<String, serde_json::Value>,
    pub cancellation: &'a CancellationToken,
}

/// A template executor. Implementations must be idempotent across retries:
/// running the same request twice yields the same output set.
#[async_trait::async_trait]
pub trait RecipeDriver: Send + Sync {
    /// Template kind this driver serves, e.g. `bicep`.
    fn kind(&self) -> &'static str;

    async fn execute(&self, request: &DriverRequest<'_>) -> Result<DriverOutput, RecipeError>;

    /// Tears down what `execute` created. Outputs the driver can no longer
    /// find count as already deleted.
    async fn destroy(
        &self,
        request: &DriverRequest<'_>,
        recorded: &[OutputResource],
    ) -> Result<(), RecipeError>;
}

/// Parses the `result` output convention shared by both drivers:
/// `{values: {...}, secrets: {...}, resources: [ids]}`.
pub(crate) fn parse_recipe_result(
    value: &serde_json::Value,
) -> Result<DriverOutput, RecipeError> {
    let mut output = DriverOutput::default();

    if let Some(values) = value.get("values") {
        let map = values
            .as_object()
            .ok_or_else(|| RecipeError::InvalidResult {
                message: "values must be an object".to_owned(),
            })?;
        output.values = map.clone().into_iter().collect();
    }

    if let Some(secrets) = value.get("secrets") {
        let map = secrets
            .as_object()
            .ok_or_else(|| RecipeError::InvalidResult {
                message: "secrets must be an object".to_owned(),
            })?;
        for (key, secret) in map {
            let secret = secret.as_str().ok_or_else(|| RecipeError::InvalidResult {
                message: format!("secret {key:?} must be a string"),
            })?;
            output.secrets.insert(key.clone(), secret.to_owned());
        }
    }

    if let Some(resources) = value.get("resources") {
        let list = resources
            .as_array()
            .ok_or_else(|| RecipeError::InvalidResult {
                message: "resources must be an array of ids".to_owned(),
            })?;
        for (index, id) in list.iter().enumerate() {
            let id = id.as_str().ok_or_else(|| RecipeError::InvalidResult {
                message: format!("resources[{index}] must be a string id"),
            })?;
            output.resources.push(OutputResource {
                local_id: format!("recipe/{index}"),
                identity: radius_resource::OutputResourceIdentity {
                    provider: provider_of(id).to_owned(),
                    api_version: None,
                    id: id.to_owned(),
                },
                radius_managed: true,
                metadata: BTreeMap::new(),
            });
        }
    }

    Ok(output)
}

/// Provider family of an output resource id: UCP ids carry their plane,
/// everything else is assumed to be Kubernetes `kind/namespace/name`.
fn provider_of(id: &str) -> &str {
    match ResourceId::parse(id) {
        Ok(parsed) => match parsed.known_plane() {
            Some(radius_resource::PlaneKind::Aws) => "aws",
            Some(radius_resource::PlaneKind::Azure) => "azure",
            Some(radius_resource::PlaneKind::Kubernetes) => "kubernetes",
            _ => "radius",
        },
        Err(_) => "kubernetes",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_full_result() {
        let output = parse_recipe_result(&json!({
            "values": {"host": "redis.internal", "port": 6379},
            "secrets": {"connectionString": "redis://..."},
            "resources": [
                "/planes/kubernetes/local/namespaces/default/providers/core/Service/redis",
                "/planes/azure/azurecloud/resourceGroups/rg/providers/Microsoft.Cache/redis/r",
            ],
        }))
        .unwrap();

        assert_eq!(output.values["port"], json!(6379));
        assert_eq!(output.secrets["connectionString"], "redis://...");
        assert_eq!(output.resources.len(), 2);
        assert_eq!(output.resources[0].identity.provider, "kubernetes");
        assert_eq!(output.resources[1].identity.provider, "azure");
        assert!(output.resources.iter().all(|r| r.radius_managed));
    }

    #[test]
    fn empty_result_is_empty_output() {
        let output = parse_recipe_result(&json!({})).unwrap();
        assert_eq!(output, DriverOutput::default());
    }

    #[test]
    fn non_string_secret_is_rejected() {
        let result = parse_recipe_result(&json!({"secrets": {"password": 42}}));
        assert!(matches!(result, Err(RecipeError::InvalidResult { .. })));
    }
}
