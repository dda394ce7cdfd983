//! Async controllers backing the built-in resource types.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use base64::Engine as _;
use radius_armrpc::{
    AsyncController, ControllerResult, OperationContext, OperationOutput,
    builder::ControllerDeps,
    frontend::CustomAction,
};
use radius_recipes::{RecipeEngine, RecipeError, RecipeRequest};
use radius_resource::{
    ErrorCode, ErrorDetail, OperationKind, ResourceEnvelope, ResourceId, ResourceStatus,
    SecretReference,
};
use radius_store::{SecretScope, SecretStore, StateStore, StateStoreExt};
use serde::Deserialize;

use crate::{
    connections::resolve_connections,
    datamodel::{
        ApplicationProperties, ContainerProperties, EnvironmentProperties, GatewayProperties,
        ResourceProvisioning, SecretStoreProperties,
    },
    renderers,
    runtime::WorkloadRuntime,
};

fn failure(code: ErrorCode, message: impl Into<String>) -> ControllerResult {
    ControllerResult::Failure {
        error: ErrorDetail::new(code, message),
        partial: None,
    }
}

/// The common shape of every recipe-backed resource's properties.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecipeBackedView {
    environment: ResourceId,
    #[serde(default)]
    application: Option<ResourceId>,
    #[serde(default)]
    recipe: crate::datamodel::RecipeBinding,
    #[serde(default)]
    resource_provisioning: ResourceProvisioning,
}

fn recipe_request(
    envelope: &ResourceEnvelope<serde_json::Value>,
) -> Result<(RecipeBackedView, RecipeRequest), ControllerResult> {
    let view: RecipeBackedView = serde_json::from_value(envelope.properties.clone())
        .map_err(|error| failure(ErrorCode::Invalid, format!("invalid properties: {error}")))?;
    let request = RecipeRequest {
        resource_id: envelope.id.clone(),
        resource_type: envelope.resource_type.clone(),
        recipe_name: view.recipe.name.clone(),
        environment_id: view.environment.clone(),
        application_id: view.application.clone(),
        parameters: view.recipe.parameters.clone(),
    };
    Ok((view, request))
}

fn map_recipe_error(error: &RecipeError) -> ControllerResult {
    match error {
        RecipeError::Cancelled => ControllerResult::Cancelled,
        RecipeError::RecipeNotFound { .. } => {
            failure(ErrorCode::RecipeNotFound, error.to_string())
        }
        RecipeError::EnvironmentNotFound { .. } => {
            failure(ErrorCode::DependencyFailure, error.to_string())
        }
        error if error.is_transient() => ControllerResult::Requeue { after: None },
        error => failure(ErrorCode::RecipeExecutionFailed, error.to_string()),
    }
}

/// Create/Update/Delete executor for every recipe-backed portable resource
/// (datastores, messaging, Dapr, extenders). Manual provisioning bypasses
/// the engine entirely.
pub struct RecipeResourceController {
    engine: Arc<RecipeEngine>,
}

impl RecipeResourceController {
    pub fn new(engine: Arc<RecipeEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl AsyncController for RecipeResourceController {
    async fn run(&self, ctx: &OperationContext) -> ControllerResult {
        let (view, request) = match recipe_request(&ctx.envelope) {
            Ok(pair) => pair,
            Err(result) => return result,
        };

        match ctx.message.kind {
            OperationKind::Delete => {
                if view.resource_provisioning == ResourceProvisioning::Recipe {
                    if let Err(error) = self
                        .engine
                        .destroy(&request, &ctx.envelope.status, &ctx.cancellation)
                        .await
                    {
                        return map_recipe_error(&error);
                    }
                }
                ControllerResult::Success(OperationOutput::Deleted)
            }
            OperationKind::Create | OperationKind::Update => {
                let status = if view.resource_provisioning == ResourceProvisioning::Manual {
                    // Manual resources carry their values inline; nothing to
                    // materialize.
                    ctx.envelope.status.clone()
                } else {
                    match self.engine.execute(&request, &ctx.cancellation).await {
                        Ok(status) => status,
                        Err(error) => return map_recipe_error(&error),
                    }
                };
                ControllerResult::Success(OperationOutput::Updated {
                    properties: ctx.envelope.properties.clone(),
                    status,
                })
            }
        }
    }
}

/// Looks up the Kubernetes namespace a resource's workload objects belong
/// to: the environment namespace suffixed with the application name.
async fn workload_namespace(
    store: &dyn StateStore,
    application: &ResourceId,
) -> Result<String, ControllerResult> {
    let (application_envelope, _etag) = store
        .get_typed::<ResourceEnvelope<ApplicationProperties>>(application)
        .await
        .map_err(|_| ControllerResult::Requeue { after: None })?
        .ok_or_else(|| {
            failure(
                ErrorCode::DependencyFailure,
                format!("application {application} no longer exists"),
            )
        })?;

    let environment = &application_envelope.properties.environment;
    let (environment_envelope, _etag) = store
        .get_typed::<ResourceEnvelope<EnvironmentProperties>>(environment)
        .await
        .map_err(|_| ControllerResult::Requeue { after: None })?
        .ok_or_else(|| {
            failure(
                ErrorCode::DependencyFailure,
                format!("environment {environment} no longer exists"),
            )
        })?;

    Ok(format!(
        "{}-{}",
        environment_envelope.properties.compute.namespace, application_envelope.name
    ))
}

/// Containers: resolve connections, render, apply.
pub struct ContainerController {
    store: Arc<dyn StateStore>,
    secrets: Arc<dyn SecretStore>,
    runtime: Arc<dyn WorkloadRuntime>,
}

impl ContainerController {
    pub fn new(
        store: Arc<dyn StateStore>,
        secrets: Arc<dyn SecretStore>,
        runtime: Arc<dyn WorkloadRuntime>,
    ) -> Self {
        Self {
            store,
            secrets,
            runtime,
        }
    }
}

#[async_trait]
impl AsyncController for ContainerController {
    async fn run(&self, ctx: &OperationContext) -> ControllerResult {
        if ctx.message.kind == OperationKind::Delete {
            return match self
                .runtime
                .delete(&ctx.envelope.status.output_resources)
                .await
            {
                Ok(()) => ControllerResult::Success(OperationOutput::Deleted),
                Err(error) if error.is_transient() => ControllerResult::Requeue { after: None },
                Err(error) => failure(ErrorCode::DependencyFailure, error.to_string()),
            };
        }

        let properties: ContainerProperties =
            match serde_json::from_value(ctx.envelope.properties.clone()) {
                Ok(properties) => properties,
                Err(error) => {
                    return failure(ErrorCode::Invalid, format!("invalid properties: {error}"));
                }
            };

        // Sources that have not converged yet defer this operation.
        let plan = match resolve_connections(self.store.as_ref(), &properties.connections).await {
            Ok(plan) => plan,
            Err(error) if error.should_defer() => {
                tracing::debug!(%error, "connection source not ready, deferring");
                return ControllerResult::Requeue { after: None };
            }
            Err(error) => return failure(ErrorCode::Invalid, error.to_string()),
        };

        let namespace = match workload_namespace(self.store.as_ref(), &properties.application).await
        {
            Ok(namespace) => namespace,
            Err(result) => return result,
        };

        // Materialize connection secrets for the rendered Secret object.
        let mut material = BTreeMap::new();
        for (env_key, reference) in &plan.secrets {
            let Ok(scope_id) = reference.store.parse::<ResourceId>() else {
                return failure(
                    ErrorCode::Internal,
                    format!("secret reference {env_key} has an invalid scope"),
                );
            };
            match self
                .secrets
                .get_secret(&SecretScope::Resource(scope_id), &reference.key)
                .await
            {
                Ok(bytes) => {
                    material.insert(env_key.clone(), bytes);
                }
                // The source may still be writing its secrets; try again.
                Err(_) => return ControllerResult::Requeue { after: None },
            }
        }

        let rendered =
            renderers::render_container(&ctx.envelope.name, &namespace, &properties, &plan, &material);

        if let Err(error) = self.runtime.apply(&rendered).await {
            return if error.is_transient() {
                ControllerResult::Requeue { after: None }
            } else {
                failure(ErrorCode::DependencyFailure, error.to_string())
            };
        }

        ControllerResult::Success(OperationOutput::Updated {
            properties: ctx.envelope.properties.clone(),
            status: ResourceStatus {
                output_resources: rendered.output_resources(),
                computed_values: BTreeMap::new(),
                secrets: ctx.envelope.status.secrets.clone(),
            },
        })
    }
}

/// Gateways render to an Ingress.
pub struct GatewayController {
    store: Arc<dyn StateStore>,
    runtime: Arc<dyn WorkloadRuntime>,
}

impl GatewayController {
    pub fn new(store: Arc<dyn StateStore>, runtime: Arc<dyn WorkloadRuntime>) -> Self {
        Self { store, runtime }
    }
}

#[async_trait]
impl AsyncController for GatewayController {
    async fn run(&self, ctx: &OperationContext) -> ControllerResult {
        if ctx.message.kind == OperationKind::Delete {
            return match self
                .runtime
                .delete(&ctx.envelope.status.output_resources)
                .await
            {
                Ok(()) => ControllerResult::Success(OperationOutput::Deleted),
                Err(error) if error.is_transient() => ControllerResult::Requeue { after: None },
                Err(error) => failure(ErrorCode::DependencyFailure, error.to_string()),
            };
        }

        let properties: GatewayProperties =
            match serde_json::from_value(ctx.envelope.properties.clone()) {
                Ok(properties) => properties,
                Err(error) => {
                    return failure(ErrorCode::Invalid, format!("invalid properties: {error}"));
                }
            };

        let namespace = match workload_namespace(self.store.as_ref(), &properties.application).await
        {
            Ok(namespace) => namespace,
            Err(result) => return result,
        };

        let rendered = renderers::render_gateway(&ctx.envelope.name, &namespace, &properties);
        if let Err(error) = self.runtime.apply(&rendered).await {
            return if error.is_transient() {
                ControllerResult::Requeue { after: None }
            } else {
                failure(ErrorCode::DependencyFailure, error.to_string())
            };
        }

        ControllerResult::Success(OperationOutput::Updated {
            properties: ctx.envelope.properties.clone(),
            status: ResourceStatus {
                output_resources: rendered.output_resources(),
                ..ResourceStatus::default()
            },
        })
    }
}

/// Secret stores: move write-only values into the secret store and persist
/// only references. The document never carries secret material.
pub struct SecretStoreController {
    secrets: Arc<dyn SecretStore>,
}

impl SecretStoreController {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl AsyncController for SecretStoreController {
    async fn run(&self, ctx: &OperationContext) -> ControllerResult {
        let scope = SecretScope::Resource(ctx.envelope.id.clone());

        if ctx.message.kind == OperationKind::Delete {
            for name in ctx.envelope.status.secrets.keys() {
                if self.secrets.delete_secret(&scope, name).await.is_err() {
                    return ControllerResult::Requeue { after: None };
                }
            }
            return ControllerResult::Success(OperationOutput::Deleted);
        }

        let mut properties: SecretStoreProperties =
            match serde_json::from_value(ctx.envelope.properties.clone()) {
                Ok(properties) => properties,
                Err(error) => {
                    return failure(ErrorCode::Invalid, format!("invalid properties: {error}"));
                }
            };

        let mut references = ctx.envelope.status.secrets.clone();
        for (name, entry) in &mut properties.data {
            let Some(value) = entry.value.take() else {
                continue;
            };
            let bytes = match entry.encoding.as_deref() {
                Some("base64") => match base64::engine::general_purpose::STANDARD.decode(&value) {
                    Ok(bytes) => bytes,
                    Err(_) => {
                        return failure(
                            ErrorCode::Invalid,
                            format!("secret {name:?} is not valid base64"),
                        );
                    }
                },
                _ => value.into_bytes(),
            };
            if self.secrets.put_secret(&scope, name, &bytes).await.is_err() {
                return ControllerResult::Requeue { after: None };
            }
            references.insert(
                name.clone(),
                SecretReference {
                    store: ctx.envelope.id.to_string(),
                    key: name.clone(),
                },
            );
        }

        let redacted = match serde_json::to_value(&properties) {
            Ok(redacted) => redacted,
            Err(error) => return failure(ErrorCode::Internal, error.to_string()),
        };
        ControllerResult::Success(OperationOutput::Updated {
            properties: redacted,
            status: ResourceStatus {
                secrets: references,
                ..ResourceStatus::default()
            },
        })
    }
}

/// `POST {secretStore}/listSecrets`: returns the stored secret values,
/// base64 encoded, for consumers that are entitled to read them.
pub struct ListSecretsAction;

#[async_trait]
impl CustomAction for ListSecretsAction {
    async fn invoke(
        &self,
        deps: &ControllerDeps,
        envelope: &ResourceEnvelope<serde_json::Value>,
    ) -> Result<serde_json::Value, ErrorDetail> {
        let scope = SecretScope::Resource(envelope.id.clone());
        let mut value = serde_json::Map::new();

        for (name, _reference) in &envelope.status.secrets {
            let bytes = deps
                .secrets
                .get_secret(&scope, name)
                .await
                .map_err(|_| ErrorDetail::new(ErrorCode::Internal, "failed to read secret"))?;
            value.insert(
                name.clone(),
                serde_json::json!({
                    "value": base64::engine::general_purpose::STANDARD.encode(bytes),
                    "encoding": "base64",
                }),
            );
        }

        Ok(serde_json::json!({ "data": value }))
    }
}
