//! Semantic validation of the built-in resource types.
//!
//! Validators run on the synchronous path, after conversion and before
//! persistence. They check referenced parents, connection shape and graph
//! acyclicity; readiness of connection sources is deliberately left to the
//! reconcile path, which can defer instead of failing the request.

use std::collections::BTreeMap;

use async_trait::async_trait;
use radius_armrpc::{ResourceValidator, ValidationContext};
use radius_resource::{Connection, ErrorCode, ErrorDetail, ResourceEnvelope, ResourceId};
use radius_store::{Query, StateStoreExt};

use crate::{
    connections::ensure_acyclic,
    datamodel::{ApplicationProperties, ContainerProperties, EnvironmentProperties},
};

fn invalid(message: impl Into<String>, target: &str) -> ErrorDetail {
    ErrorDetail::new(ErrorCode::Invalid, message).with_target(target)
}

async fn parent_exists(
    ctx: &ValidationContext<'_>,
    id: &ResourceId,
    target: &str,
) -> Result<(), ErrorDetail> {
    let exists = ctx
        .deps
        .store
        .get(id)
        .await
        .map_err(|_| ErrorDetail::new(ErrorCode::Internal, "failed to read referenced resource"))?
        .is_some();
    if exists {
        Ok(())
    } else {
        Err(ErrorDetail::new(ErrorCode::Invalid, format!("{id} does not exist")).with_target(target))
    }
}

fn properties<P: serde::de::DeserializeOwned>(
    ctx: &ValidationContext<'_>,
) -> Result<P, ErrorDetail> {
    serde_json::from_value(ctx.envelope.properties.clone())
        .map_err(|error| invalid(format!("invalid properties: {error}"), "/properties"))
}

/// Kubernetes namespaces are RFC 1123 labels.
fn is_valid_namespace(namespace: &str) -> bool {
    !namespace.is_empty()
        && namespace.len() <= 63
        && namespace
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !namespace.starts_with('-')
        && !namespace.ends_with('-')
}

/// `Applications.Core/environments`: compute shape on writes, no dependent
/// applications on deletes.
pub struct EnvironmentValidator;

#[async_trait]
impl ResourceValidator for EnvironmentValidator {
    async fn validate(&self, ctx: &ValidationContext<'_>) -> Result<(), ErrorDetail> {
        let properties: EnvironmentProperties = properties(ctx)?;

        if !properties.compute.kind.eq_ignore_ascii_case("kubernetes") {
            return Err(invalid(
                format!("compute kind {:?} is not supported", properties.compute.kind),
                "/properties/compute/kind",
            ));
        }
        if !is_valid_namespace(&properties.compute.namespace) {
            return Err(invalid(
                format!(
                    "{:?} is not a valid kubernetes namespace",
                    properties.compute.namespace
                ),
                "/properties/compute/namespace",
            ));
        }

        for (resource_type, recipes) in &properties.recipes {
            for (name, definition) in recipes {
                let kind = definition.template_kind.to_ascii_lowercase();
                if kind != "bicep" && kind != "terraform" {
                    return Err(invalid(
                        format!("recipe {name:?} has unsupported template kind {kind:?}"),
                        &format!("/properties/recipes/{resource_type}/{name}/templateKind"),
                    ));
                }
            }
        }
        Ok(())
    }

    async fn validate_delete(&self, ctx: &ValidationContext<'_>) -> Result<(), ErrorDetail> {
        // An environment with live applications refuses deletion.
        let query = Query {
            root_scope: ctx.envelope.id.plane_scope().to_string(),
            scope_recursive: true,
            resource_type: Some("Applications.Core/applications".to_owned()),
            continuation: None,
            limit: Some(usize::MAX),
        };
        let page = ctx
            .deps
            .store
            .query(query)
            .await
            .map_err(|_| ErrorDetail::new(ErrorCode::Internal, "failed to list applications"))?;

        for entry in page.items {
            let Ok(application) = entry.to_typed::<ResourceEnvelope<ApplicationProperties>>()
            else {
                continue;
            };
            if application.properties.environment == ctx.envelope.id {
                return Err(ErrorDetail::new(
                    ErrorCode::Conflict,
                    format!(
                        "environment {} is still referenced by application {}",
                        ctx.envelope.id, application.id
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// `Applications.Core/applications`: the referenced environment must exist.
pub struct ApplicationValidator;

#[async_trait]
impl ResourceValidator for ApplicationValidator {
    async fn validate(&self, ctx: &ValidationContext<'_>) -> Result<(), ErrorDetail> {
        let properties: ApplicationProperties = properties(ctx)?;
        parent_exists(ctx, &properties.environment, "/properties/environment").await
    }
}

/// `Applications.Core/containers`: the application must exist, connections
/// must be well-formed, and the application graph must stay acyclic for
/// non-network connection kinds.
pub struct ContainerValidator;

#[async_trait]
impl ResourceValidator for ContainerValidator {
    async fn validate(&self, ctx: &ValidationContext<'_>) -> Result<(), ErrorDetail> {
        let properties: ContainerProperties = properties(ctx)?;
        parent_exists(ctx, &properties.application, "/properties/application").await?;

        if properties.container.image.is_empty() {
            return Err(invalid("an image is required", "/properties/container/image"));
        }

        for (name, connection) in &properties.connections {
            let target = format!("/properties/connections/{name}/source");
            if connection.source.is_empty() {
                return Err(invalid("a connection source is required", &target));
            }
            let is_url = connection.source.contains("://");
            if is_url && !connection.kind.is_network() {
                return Err(invalid(
                    "only http connections may target a URL",
                    &target,
                ));
            }
            if !is_url && connection.source.parse::<ResourceId>().is_err() {
                return Err(invalid(
                    format!("{:?} is not a valid resource id", connection.source),
                    &target,
                ));
            }
            if connection.source.parse::<ResourceId>().ok().as_ref() == Some(&ctx.envelope.id) {
                return Err(invalid("a resource cannot connect to itself", &target));
            }
        }

        // Cycle check over the candidate and its siblings in the application.
        let siblings = application_containers(ctx, &properties.application).await?;
        if let Err(cycle) = ensure_acyclic((&ctx.envelope.id, &properties.connections), &siblings)
        {
            let chain = cycle
                .iter()
                .map(|id| id.name().unwrap_or_default().to_owned())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(invalid(
                format!("connections form a provisioning cycle: {chain}"),
                "/properties/connections",
            ));
        }
        Ok(())
    }
}

async fn application_containers(
    ctx: &ValidationContext<'_>,
    application: &ResourceId,
) -> Result<Vec<(ResourceId, BTreeMap<String, Connection>)>, ErrorDetail> {
    let query = Query {
        root_scope: ctx.envelope.id.root_scope(),
        scope_recursive: false,
        resource_type: Some("Applications.Core/containers".to_owned()),
        continuation: None,
        limit: Some(usize::MAX),
    };
    let page = ctx
        .deps
        .store
        .query(query)
        .await
        .map_err(|_| ErrorDetail::new(ErrorCode::Internal, "failed to list containers"))?;

    let mut siblings = Vec::new();
    for entry in page.items {
        let Ok(container) = entry.to_typed::<ResourceEnvelope<ContainerProperties>>() else {
            continue;
        };
        if container.properties.application == *application {
            siblings.push((container.id, container.properties.connections));
        }
    }
    Ok(siblings)
}

/// Shared validator of recipe-backed portable resources: environment must
/// exist and, when an application is given, it must exist and belong to the
/// same environment.
pub struct PortableResourceValidator;

#[derive(serde::Deserialize)]
struct PortableView {
    environment: ResourceId,
    #[serde(default)]
    application: Option<ResourceId>,
}

#[async_trait]
impl ResourceValidator for PortableResourceValidator {
    async fn validate(&self, ctx: &ValidationContext<'_>) -> Result<(), ErrorDetail> {
        let view: PortableView = properties(ctx)?;
        parent_exists(ctx, &view.environment, "/properties/environment").await?;

        if let Some(application) = &view.application {
            parent_exists(ctx, application, "/properties/application").await?;
            let (envelope, _etag) = ctx
                .deps
                .store
                .get_typed::<ResourceEnvelope<ApplicationProperties>>(application)
                .await
                .map_err(|_| {
                    ErrorDetail::new(ErrorCode::Internal, "failed to read the application")
                })?
                .ok_or_else(|| {
                    invalid(
                        format!("{application} does not exist"),
                        "/properties/application",
                    )
                })?;
            if envelope.properties.environment != view.environment {
                return Err(invalid(
                    "the application belongs to a different environment",
                    "/properties/application",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::simple("default", true)]
    #[case::dashed("my-env", true)]
    #[case::empty("", false)]
    #[case::upper("Default", false)]
    #[case::leading_dash("-x", false)]
    #[case::trailing_dash("x-", false)]
    #[case::too_long(&"a".repeat(64), false)]
    fn namespace_validation(#[case] namespace: &str, #[case] ok: bool) {
        assert_eq!(is_valid_namespace(namespace), ok);
    }
}
