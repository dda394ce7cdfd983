//! Recipe resolution and orchestration.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use radius_resource::{ResourceEnvelope, ResourceId, ResourceStatus, SecretReference};
use radius_store::{SecretScope, SecretStore, StateStore, StateStoreExt};
use serde::Deserialize;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;

use crate::{
    DriverOutput, DriverRequest, EnvironmentUnreadableSnafu, RecipeDriver, RecipeError,
    RecipeDefinition, StateSecretSnafu,
    context::{CloudScopes, ContextIdentity, KubernetesRuntime, RecipeContext},
};

/// The slice of an environment document the engine needs: compute, cloud
/// scopes and the recipe catalog, keyed `resourceType → recipeName`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentView {
    #[serde(default)]
    pub compute: ComputeView,
    #[serde(default)]
    pub recipes: BTreeMap<String, BTreeMap<String, RecipeDefinition>>,
    #[serde(default)]
    pub providers: CloudScopes,
    /// Simulated environments accept deployments but materialize nothing.
    #[serde(default)]
    pub simulated: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeView {
    #[serde(default)]
    pub kind: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for ComputeView {
    fn default() -> Self {
        Self {
            kind: "kubernetes".to_owned(),
            namespace: default_namespace(),
        }
    }
}

fn default_namespace() -> String {
    "default".to_owned()
}

/// One engine invocation, assembled by the calling controller.
pub struct RecipeRequest {
    pub resource_id: ResourceId,
    pub resource_type: String,
    /// Recipe name the resource asked for; empty means `default`.
    pub recipe_name: String,
    pub environment_id: ResourceId,
    pub application_id: Option<ResourceId>,
    /// Developer-supplied parameters from the resource body.
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl RecipeRequest {
    fn recipe_name(&self) -> &str {
        if self.recipe_name.is_empty() {
            "default"
        } else {
            &self.recipe_name
        }
    }
}

pub struct RecipeEngine {
    store: Arc<dyn StateStore>,
    secrets: Arc<dyn SecretStore>,
    drivers: HashMap<&'static str, Arc<dyn RecipeDriver>>,
}

impl RecipeEngine {
    pub fn new(store: Arc<dyn StateStore>, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            secrets,
            drivers: HashMap::new(),
        }
    }

    pub fn driver(mut self, driver: Arc<dyn RecipeDriver>) -> Self {
        self.drivers.insert(driver.kind(), driver);
        self
    }

    /// Executes the recipe for a create/update and returns the status to
    /// attach to the resource document. Secret material is written to the
    /// secret store here; the returned status only carries references.
    pub async fn execute(
        &self,
        request: &RecipeRequest,
        cancellation: &CancellationToken,
    ) -> Result<ResourceStatus, RecipeError> {
        let environment = self.load_environment(&request.environment_id).await?;
        if environment.simulated {
            tracing::debug!(environment = %request.environment_id, "environment is simulated, skipping recipe");
            return Ok(ResourceStatus::default());
        }

        let (definition, context, parameters) = self.resolve(request, &environment).await?;
        let driver = self.driver_for(&definition)?;

        let output = driver
            .execute(&DriverRequest {
                definition: &definition,
                context: &context,
                parameters: &parameters,
                cancellation,
            })
            .await?;

        self.attach(request, output).await
    }

    /// Runs the recipe in destroy mode and deletes the secrets recorded on
    /// the resource. A recipe that has since vanished from the environment
    /// is treated as already torn down.
    pub async fn destroy(
        &self,
        request: &RecipeRequest,
        recorded: &ResourceStatus,
        cancellation: &CancellationToken,
    ) -> Result<(), RecipeError> {
        let environment = self.load_environment(&request.environment_id).await;
        match environment {
            Ok(environment) if !environment.simulated => {
                match self.resolve(request, &environment).await {
                    Ok((definition, context, parameters)) => {
                        let driver = self.driver_for(&definition)?;
                        driver
                            .destroy(
                                &DriverRequest {
                                    definition: &definition,
                                    context: &context,
                                    parameters: &parameters,
                                    cancellation,
                                },
                                &recorded.output_resources,
                            )
                            .await?;
                    }
                    Err(RecipeError::RecipeNotFound { name, resource_type }) => {
                        tracing::warn!(
                            name,
                            resource_type,
                            "recipe vanished from the environment, skipping driver teardown"
                        );
                    }
                    Err(error) => return Err(error),
                }
            }
            Ok(_) => {}
            Err(RecipeError::EnvironmentNotFound { id }) => {
                tracing::warn!(environment = %id, "environment is gone, skipping driver teardown");
            }
            Err(error) => return Err(error),
        }

        // Drop every secret the resource recorded, plus any recipe state.
        let scope = SecretScope::Resource(request.resource_id.clone());
        for name in recorded.secrets.keys() {
            self.secrets
                .delete_secret(&scope, name)
                .await
                .context(StateSecretSnafu)?;
        }
        Ok(())
    }

    async fn load_environment(&self, id: &ResourceId) -> Result<EnvironmentView, RecipeError> {
        let envelope = self
            .store
            .get_typed::<ResourceEnvelope<EnvironmentView>>(id)
            .await
            .context(EnvironmentUnreadableSnafu { id: id.clone() })?;
        match envelope {
            Some((envelope, _etag)) => Ok(envelope.properties),
            None => Err(RecipeError::EnvironmentNotFound { id: id.clone() }),
        }
    }

    async fn resolve(
        &self,
        request: &RecipeRequest,
        environment: &EnvironmentView,
    ) -> Result<
        (
            RecipeDefinition,
            RecipeContext,
            BTreeMap<String, serde_json::Value>,
        ),
        RecipeError,
    > {
        let name = request.recipe_name();
        let definition = environment
            .recipes
            .iter()
            .find(|(resource_type, _)| resource_type.eq_ignore_ascii_case(&request.resource_type))
            .and_then(|(_, recipes)| recipes.get(name))
            .cloned()
            .ok_or_else(|| RecipeError::RecipeNotFound {
                name: name.to_owned(),
                resource_type: request.resource_type.clone(),
            })?;

        let application = request.application_id.as_ref().map(ContextIdentity::from_id);
        let namespace = match &application {
            Some(application) => {
                format!("{}-{}", environment.compute.namespace, application.name)
            }
            None => environment.compute.namespace.clone(),
        };

        let context = RecipeContext {
            resource: ContextIdentity::from_id(&request.resource_id),
            application,
            environment: ContextIdentity::from_id(&request.environment_id),
            runtime: KubernetesRuntime {
                namespace,
                environment_namespace: environment.compute.namespace.clone(),
            },
            cloud: environment.providers.clone(),
        };

        let parameters = merge_parameters(&definition, &request.parameters);
        Ok((definition, context, parameters))
    }

    fn driver_for(&self, definition: &RecipeDefinition) -> Result<&Arc<dyn RecipeDriver>, RecipeError> {
        self.drivers
            .get(definition.template_kind.to_ascii_lowercase().as_str())
            .ok_or_else(|| RecipeError::DriverNotFound {
                kind: definition.template_kind.clone(),
            })
    }

    /// Moves secrets out of the driver output into the secret store and
    /// builds the status to persist on the resource.
    async fn attach(
        &self,
        request: &RecipeRequest,
        output: DriverOutput,
    ) -> Result<ResourceStatus, RecipeError> {
        let scope = SecretScope::Resource(request.resource_id.clone());
        let mut status = ResourceStatus {
            output_resources: output.resources,
            computed_values: output.values,
            secrets: BTreeMap::new(),
        };

        for (name, value) in output.secrets {
            self.secrets
                .put_secret(&scope, &name, value.as_bytes())
                .await
                .context(StateSecretSnafu)?;
            status.secrets.insert(
                name.clone(),
                SecretReference {
                    store: request.resource_id.to_string(),
                    key: name,
                },
            );
        }

        Ok(status)
    }
}

/// Parameter precedence: user values override recipe defaults, except for
/// keys the recipe is authoritative for.
fn merge_parameters(
    definition: &RecipeDefinition,
    user: &BTreeMap<String, serde_json::Value>,
) -> BTreeMap<String, serde_json::Value> {
    let mut merged = definition.parameters.clone();
    for (key, value) in user {
        if definition.authoritative.contains(key) {
            continue;
        }
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use radius_resource::OutputResource;
    use radius_store::{InMemorySecretStore, InMemoryStateStore, WritePrecondition};
    use serde_json::json;

    use super::*;

    fn env_id() -> ResourceId {
        "/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/environments/env"
            .parse()
            .unwrap()
    }

    fn cache_id(name: &str) -> ResourceId {
        format!(
            "/planes/radius/local/resourceGroups/rg1/providers/Applications.Datastores/redisCaches/{name}"
        )
        .parse()
        .unwrap()
    }

    fn request(name: &str) -> RecipeRequest {
        RecipeRequest {
            resource_id: cache_id(name),
            resource_type: "Applications.Datastores/redisCaches".into(),
            recipe_name: String::new(),
            environment_id: env_id(),
            application_id: None,
            parameters: BTreeMap::from([("size".to_owned(), json!("user"))]),
        }
    }

    struct FakeDriver {
        requests: Mutex<Vec<BTreeMap<String, serde_json::Value>>>,
        output: DriverOutput,
    }

    impl FakeDriver {
        fn new(output: DriverOutput) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                output,
            })
        }
    }

    #[async_trait]
    impl RecipeDriver for FakeDriver {
        fn kind(&self) -> &'static str {
            "bicep"
        }

        async fn execute(&self, request: &DriverRequest<'_>) -> Result<DriverOutput, RecipeError> {
            self.requests
                .lock()
                .unwrap()
                .push(request.parameters.clone());
            Ok(self.output.clone())
        }

        async fn destroy(
            &self,
            _request: &DriverRequest<'_>,
            _recorded: &[OutputResource],
        ) -> Result<(), RecipeError> {
            Ok(())
        }
    }

    async fn seed_environment(store: &InMemoryStateStore, properties: serde_json::Value) {
        let envelope = json!({
            "id": env_id(),
            "name": "env",
            "type": "Applications.Core/environments",
            "location": "global",
            "provisioningState": "Succeeded",
            "systemData": {},
            "internalMetadata": {"updatedApiVersion": "2023-10-01-preview"},
            "properties": properties,
        });
        store
            .save(&env_id(), envelope, WritePrecondition::None)
            .await
            .unwrap();
    }

    fn catalog() -> serde_json::Value {
        json!({
            "compute": {"kind": "kubernetes", "namespace": "default"},
            "recipes": {
                "Applications.Datastores/redisCaches": {
                    "default": {
                        "templateKind": "bicep",
                        "templatePath": "https://templates.internal/redis.json",
                        "parameters": {"size": "recipe", "tier": "basic"},
                        "authoritative": ["tier"],
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn executes_and_attaches_outputs_and_secrets() {
        let store = Arc::new(InMemoryStateStore::new());
        let secrets = Arc::new(InMemorySecretStore::new());
        seed_environment(&store, catalog()).await;

        let driver = FakeDriver::new(DriverOutput {
            resources: vec![OutputResource::kubernetes(
                "recipe/0",
                "v1",
                "Service",
                "default",
                "redis",
            )],
            values: BTreeMap::from([("host".to_owned(), json!("redis.default.svc"))]),
            secrets: BTreeMap::from([("connectionString".to_owned(), "redis://x".to_owned())]),
        });
        let engine = RecipeEngine::new(store, secrets.clone()).driver(driver.clone());

        let status = engine
            .execute(&request("cache"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(status.output_resources.len(), 1);
        assert_eq!(status.computed_values["host"], json!("redis.default.svc"));
        // The document gets a reference, the store gets the material.
        let reference = &status.secrets["connectionString"];
        assert_eq!(reference.key, "connectionString");
        let stored = secrets
            .get_secret(
                &SecretScope::Resource(cache_id("cache")),
                "connectionString",
            )
            .await
            .unwrap();
        assert_eq!(stored, b"redis://x");
    }

    #[tokio::test]
    async fn parameter_precedence() {
        let store = Arc::new(InMemoryStateStore::new());
        seed_environment(&store, catalog()).await;
        let driver = FakeDriver::new(DriverOutput::default());
        let engine =
            RecipeEngine::new(store, Arc::new(InMemorySecretStore::new())).driver(driver.clone());

        let mut request = request("cache");
        request
            .parameters
            .insert("tier".to_owned(), json!("premium"));
        engine
            .execute(&request, &CancellationToken::new())
            .await
            .unwrap();

        let seen = driver.requests.lock().unwrap();
        let parameters = &seen[0];
        // User wins on ordinary keys, the recipe wins on authoritative keys.
        assert_eq!(parameters["size"], json!("user"));
        assert_eq!(parameters["tier"], json!("basic"));
    }

    #[tokio::test]
    async fn missing_recipe_is_recipe_not_found() {
        let store = Arc::new(InMemoryStateStore::new());
        seed_environment(&store, json!({"recipes": {}})).await;
        let engine = RecipeEngine::new(store, Arc::new(InMemorySecretStore::new()))
            .driver(FakeDriver::new(DriverOutput::default()));

        let result = engine
            .execute(&request("cache"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(RecipeError::RecipeNotFound { .. })));
    }

    #[tokio::test]
    async fn missing_environment_is_reported() {
        let store = Arc::new(InMemoryStateStore::new());
        let engine = RecipeEngine::new(store, Arc::new(InMemorySecretStore::new()))
            .driver(FakeDriver::new(DriverOutput::default()));

        let result = engine
            .execute(&request("cache"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(RecipeError::EnvironmentNotFound { .. })));
    }

    #[tokio::test]
    async fn simulated_environment_skips_the_driver() {
        let store = Arc::new(InMemoryStateStore::new());
        let mut properties = catalog();
        properties["simulated"] = json!(true);
        seed_environment(&store, properties).await;

        let driver = FakeDriver::new(DriverOutput::default());
        let engine =
            RecipeEngine::new(store, Arc::new(InMemorySecretStore::new())).driver(driver.clone());

        let status = engine
            .execute(&request("cache"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(status, ResourceStatus::default());
        assert!(driver.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn destroy_removes_recorded_secrets() {
        let store = Arc::new(InMemoryStateStore::new());
        let secrets = Arc::new(InMemorySecretStore::new());
        seed_environment(&store, catalog()).await;
        let scope = SecretScope::Resource(cache_id("cache"));
        secrets
            .put_secret(&scope, "connectionString", b"redis://x")
            .await
            .unwrap();

        let engine = RecipeEngine::new(store, secrets.clone())
            .driver(FakeDriver::new(DriverOutput::default()));
        let recorded = ResourceStatus {
            secrets: BTreeMap::from([(
                "connectionString".to_owned(),
                SecretReference {
                    store: cache_id("cache").to_string(),
                    key: "connectionString".to_owned(),
                },
            )]),
            ..ResourceStatus::default()
        };

        engine
            .destroy(&request("cache"), &recorded, &CancellationToken::new())
            .await
            .unwrap();
        assert!(secrets.get_secret(&scope, "connectionString").await.is_err());
    }
}
