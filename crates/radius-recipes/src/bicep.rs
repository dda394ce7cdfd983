//! Bicep driver: submits compiled templates to the Deployment Engine
//! collaborator and polls the resulting long-running deployment.

use std::{collections::BTreeMap, time::Duration};

use serde_json::json;
use sha2::{Digest, Sha256};
use snafu::ResultExt;
use url::Url;

use crate::{
    DeploymentEngineSnafu, DriverOutput, DriverRequest, FetchTemplateSnafu, RecipeDriver,
    RecipeError, parse_recipe_result,
};

const DEPLOYMENT_API_VERSION: &str = "2020-10-01";

pub struct BicepDriver {
    client: reqwest::Client,
    base_url: Url,
    poll_interval: Duration,
}

impl BicepDriver {
    pub fn new(base_url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            poll_interval: Duration::from_secs(3),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Deployment names must be stable across retries so the deployment
    /// engine converges instead of forking deployments.
    fn deployment_name(resource_id: &str) -> String {
        let digest = Sha256::digest(resource_id.to_ascii_lowercase().as_bytes());
        let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
        format!("recipe-{}", &hex[..16])
    }

    fn deployment_url(&self, request: &DriverRequest<'_>) -> String {
        let scope = request.context.resource.id.root_scope();
        let name = Self::deployment_name(&request.context.resource.id.to_string());
        format!(
            "{}{scope}/providers/Microsoft.Resources/deployments/{name}?api-version={DEPLOYMENT_API_VERSION}",
            self.base_url.as_str().trim_end_matches('/'),
        )
    }

    async fn fetch_template(&self, url: &str) -> Result<serde_json::Value, RecipeError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(FetchTemplateSnafu { url })?;
        response
            .json::<serde_json::Value>()
            .await
            .context(FetchTemplateSnafu { url })
    }

    async fn poll(
        &self,
        url: &str,
        request: &DriverRequest<'_>,
    ) -> Result<serde_json::Value, RecipeError> {
        loop {
            tokio::select! {
                () = request.cancellation.cancelled() => return Err(RecipeError::Cancelled),
                () = tokio::time::sleep(self.poll_interval) => {}
            }

            let deployment: serde_json::Value = self
                .client
                .get(url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .context(DeploymentEngineSnafu)?
                .json()
                .await
                .context(DeploymentEngineSnafu)?;

            let state = deployment["properties"]["provisioningState"]
                .as_str()
                .unwrap_or("Running");
            match state {
                "Succeeded" => return Ok(deployment),
                "Failed" | "Canceled" => {
                    let message = deployment["properties"]["error"]["message"]
                        .as_str()
                        .unwrap_or("the deployment engine reported a failure")
                        .to_owned();
                    return Err(RecipeError::DeploymentFailed { message });
                }
                _ => {}
            }
        }
    }
}

#[async_trait::async_trait]
impl RecipeDriver for BicepDriver {
    fn kind(&self) -> &'static str {
        "bicep"
    }

    async fn execute(&self, request: &DriverRequest<'_>) -> Result<DriverOutput, RecipeError> {
        let template = self.fetch_template(&request.definition.template_path).await?;
        let url = self.deployment_url(request);

        // ARM parameter shape: every value wrapped in {"value": ...}; the
        // recipe context rides along as its own parameter.
        let mut parameters: BTreeMap<String, serde_json::Value> = request
            .parameters
            .iter()
            .map(|(key, value)| (key.clone(), json!({ "value": value })))
            .collect();
        parameters.insert("context".to_owned(), json!({ "value": request.context }));

        let body = json!({
            "properties": {
                "mode": "Incremental",
                "template": template,
                "parameters": parameters,
            }
        });

        tracing::debug!(%url, "submitting deployment");
        self.client
            .put(&url)
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(DeploymentEngineSnafu)?;

        let deployment = self.poll(&url, request).await?;

        // Resources provisioned by the deployment, plus whatever the recipe
        // declared through the `result` output.
        let mut output = match deployment["properties"]["outputs"]["result"].get("value") {
            Some(result) => parse_recipe_result(result)?,
            None => DriverOutput::default(),
        };
        if let Some(provisioned) = deployment["properties"]["outputResources"].as_array() {
            for (index, entry) in provisioned.iter().enumerate() {
                let Some(id) = entry["id"].as_str() else {
                    continue;
                };
                if output.resources.iter().any(|r| r.identity.id == id) {
                    continue;
                }
                output.resources.push(radius_resource::OutputResource {
                    local_id: format!("deployment/{index}"),
                    identity: radius_resource::OutputResourceIdentity {
                        provider: "azure".to_owned(),
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

    async fn destroy(
        &self,
        request: &DriverRequest<'_>,
        _recorded: &[radius_resource::OutputResource],
    ) -> Result<(), RecipeError> {
        let url = self.deployment_url(request);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .context(DeploymentEngineSnafu)?;

        // A deployment the engine no longer knows counts as deleted.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        response.error_for_status().context(DeploymentEngineSnafu)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_names_are_stable_and_case_folded() {
        let a = BicepDriver::deployment_name(
            "/planes/radius/local/resourceGroups/rg1/providers/Applications.Datastores/redisCaches/cache",
        );
        let b = BicepDriver::deployment_name(
            "/planes/radius/local/resourcegroups/rg1/providers/applications.datastores/rediscaches/cache",
        );
        assert_eq!(a, b);
        assert!(a.starts_with("recipe-"));
        assert_eq!(a.len(), "recipe-".len() + 16);
    }

    #[test]
    fn deployment_url_targets_the_resource_scope() {
        let driver = BicepDriver::new(Url::parse("http://localhost:5017").unwrap());
        let definition = crate::RecipeDefinition {
            template_kind: "bicep".into(),
            template_path: "https://templates.internal/redis.json".into(),
            template_version: None,
            parameters: BTreeMap::new(),
            authoritative: Default::default(),
        };
        let context = crate::context::RecipeContext {
            resource: crate::context::ContextIdentity::from_id(
                &"/planes/radius/local/resourceGroups/rg1/providers/Applications.Datastores/redisCaches/cache"
                    .parse()
                    .unwrap(),
            ),
            application: None,
            environment: crate::context::ContextIdentity::from_id(
                &"/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/environments/env"
                    .parse()
                    .unwrap(),
            ),
            runtime: crate::context::KubernetesRuntime {
                namespace: "default".into(),
                environment_namespace: "default".into(),
            },
            cloud: Default::default(),
        };
        let parameters = BTreeMap::new();
        let token = tokio_util::sync::CancellationToken::new();
        let request = DriverRequest {
            definition: &definition,
            context: &context,
            parameters: &parameters,
            cancellation: &token,
        };

        let url = driver.deployment_url(&request);
        assert!(url.starts_with(
            "http://localhost:5017/planes/radius/local/resourceGroups/rg1/providers/Microsoft.Resources/deployments/recipe-"
        ));
        assert!(url.ends_with("?api-version=2020-10-01"));
    }
}
