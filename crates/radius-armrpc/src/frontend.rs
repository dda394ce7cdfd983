//! Default front-end controllers: the synchronous half of every resource
//! operation.
//!
//! A PUT parses and converts the body, checks preconditions against the
//! stored ETag, runs the type's validator and persists desired state; for
//! asynchronous types it then allocates an operation status and enqueues the
//! operation. The enqueue is the commit point: once it succeeds the response
//! is sent and a worker is guaranteed to observe the message.

use async_trait::async_trait;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use radius_queue::OperationMessage;
use radius_resource::{
    ErrorCode, ErrorDetail, IdentityType, InternalMetadata, OperationKind, ProvisioningState,
    ResourceEnvelope,
};
use radius_store::{Entry, StateStoreExt, StoreError, WritePrecondition};
use serde_json::json;

use crate::{
    builder::{ControllerDeps, Lifecycle, RegisteredType},
    context::RequestContext,
    convert::ConversionError,
    rest,
};

/// Validation context handed to a type-specific validator.
pub struct ValidationContext<'a> {
    pub deps: &'a ControllerDeps,
    /// The candidate state about to be persisted (for deletes: the current
    /// state about to be removed).
    pub envelope: &'a ResourceEnvelope<serde_json::Value>,
    pub existing: Option<&'a ResourceEnvelope<serde_json::Value>>,
}

/// Type-specific semantic validation, run after conversion and precondition
/// checks and before anything is persisted.
#[async_trait]
pub trait ResourceValidator: Send + Sync {
    async fn validate(&self, ctx: &ValidationContext<'_>) -> Result<(), ErrorDetail>;

    /// Veto for deletes; the default allows them.
    async fn validate_delete(&self, _ctx: &ValidationContext<'_>) -> Result<(), ErrorDetail> {
        Ok(())
    }
}

/// A POST custom action on a resource instance, e.g. `listSecrets`.
#[async_trait]
pub trait CustomAction: Send + Sync {
    async fn invoke(
        &self,
        deps: &ControllerDeps,
        envelope: &ResourceEnvelope<serde_json::Value>,
    ) -> Result<serde_json::Value, ErrorDetail>;
}

pub(crate) fn store_error_detail(error: &StoreError) -> ErrorDetail {
    match error {
        StoreError::NotFound { id } => {
            ErrorDetail::new(ErrorCode::NotFound, format!("resource {id} was not found"))
        }
        StoreError::ConcurrencyConflict { id } => ErrorDetail::new(
            ErrorCode::PreconditionFailed,
            format!("resource {id} was modified concurrently"),
        ),
        StoreError::AlreadyExists { id } => ErrorDetail::new(
            ErrorCode::PreconditionFailed,
            format!("resource {id} already exists"),
        ),
        _ => ErrorDetail::new(ErrorCode::Internal, "storage request failed"),
    }
}

fn conversion_error_detail(error: &ConversionError) -> ErrorDetail {
    match error {
        ConversionError::UnsupportedApiVersion { .. } => {
            ErrorDetail::new(ErrorCode::UnsupportedAPIVersion, error.to_string())
        }
        ConversionError::InvalidPayload { .. } => {
            ErrorDetail::new(ErrorCode::Invalid, error.to_string()).with_target("/")
        }
        ConversionError::RenderDocument { .. } => {
            ErrorDetail::new(ErrorCode::Internal, error.to_string())
        }
    }
}

fn typed_envelope(entry: &Entry) -> Result<ResourceEnvelope<serde_json::Value>, Response> {
    entry
        .to_typed::<ResourceEnvelope<serde_json::Value>>()
        .map_err(|error| rest::error_response(store_error_detail(&error)))
}

/// Operation status and result URLs for the accepted-async headers.
fn operation_urls(ctx: &RequestContext, namespace: &str, operation_id: uuid::Uuid) -> (String, String) {
    let plane = ctx.resource_id.plane_scope();
    let status = format!(
        "{plane}/providers/{namespace}/locations/global/operationStatuses/{operation_id}?api-version={}",
        ctx.api_version
    );
    let result = format!(
        "{plane}/providers/{namespace}/locations/global/operationResults/{operation_id}?api-version={}",
        ctx.api_version
    );
    (status, result)
}

fn namespace_of(registered: &RegisteredType) -> &str {
    registered
        .qualified_type
        .split('/')
        .next()
        .unwrap_or(&registered.qualified_type)
}

/// Accepts an async operation: status document first, then the queue write.
/// Once `enqueue` returns the operation is dequeuable.
async fn accept_operation(
    deps: &ControllerDeps,
    ctx: &RequestContext,
    kind: OperationKind,
) -> Result<uuid::Uuid, Response> {
    let status = deps
        .operations
        .create(ctx.resource_id.clone(), kind)
        .await
        .map_err(|error| rest::error_response(store_error_detail(&error)))?;

    let message = OperationMessage::new(
        ctx.resource_id.clone(),
        status.operation_id,
        kind,
        &ctx.api_version,
    );
    deps.queue.enqueue(message).await.map_err(|error| {
        tracing::error!(%error, resource_id = %ctx.resource_id, "failed to enqueue operation");
        rest::error(ErrorCode::Internal, "failed to enqueue the operation")
    })?;

    Ok(status.operation_id)
}

pub async fn put_resource(
    deps: &ControllerDeps,
    registered: &RegisteredType,
    ctx: &RequestContext,
    body: &[u8],
) -> Response {
    let codec = match registered.codec(&ctx.api_version) {
        Ok(codec) => codec,
        Err(error) => return rest::error_response(conversion_error_detail(&error)),
    };
    let payload = match codec.to_internal(body) {
        Ok(payload) => payload,
        Err(error) => return rest::error_response(conversion_error_detail(&error)),
    };

    let existing_entry = match deps.store.get(&ctx.resource_id).await {
        Ok(entry) => entry,
        Err(error) => return rest::error_response(store_error_detail(&error)),
    };
    let existing = match existing_entry.as_ref().map(typed_envelope).transpose() {
        Ok(existing) => existing,
        Err(response) => return response,
    };

    // Precondition checks before any write.
    if ctx.if_none_match_any && existing.is_some() {
        return rest::error(
            ErrorCode::PreconditionFailed,
            "the resource already exists and If-None-Match: * was given",
        );
    }
    if let Some(if_match) = &ctx.if_match {
        match &existing_entry {
            None => {
                return rest::error(
                    ErrorCode::PreconditionFailed,
                    "If-Match was given but the resource does not exist",
                );
            }
            Some(entry) if entry.etag != *if_match => {
                return rest::error(
                    ErrorCode::PreconditionFailed,
                    "the provided ETag does not match the current resource",
                );
            }
            Some(_) => {}
        }
    }

    let synchronous = registered.lifecycle == Lifecycle::Synchronous;
    let now = Utc::now();
    let is_new = existing.is_none();

    let mut envelope = match existing.clone() {
        Some(mut envelope) => {
            if let Some(location) = payload.location {
                envelope.location = location;
            }
            envelope.properties = payload.properties;
            envelope.provisioning_state = if synchronous {
                ProvisioningState::Succeeded
            } else {
                ProvisioningState::Updating
            };
            envelope.internal_metadata.updated_api_version = ctx.api_version.clone();
            envelope
        }
        None => ResourceEnvelope {
            id: ctx.resource_id.clone(),
            name: ctx.resource_id.name().unwrap_or_default().to_owned(),
            resource_type: registered.qualified_type.clone(),
            location: payload.location.unwrap_or_else(|| "global".to_owned()),
            provisioning_state: if synchronous {
                ProvisioningState::Succeeded
            } else {
                ProvisioningState::Accepted
            },
            system_data: radius_resource::SystemData::default(),
            internal_metadata: InternalMetadata {
                created_api_version: Some(ctx.api_version.clone()),
                updated_api_version: ctx.api_version.clone(),
                synchronous,
                async_operation_id: None,
            },
            status: radius_resource::ResourceStatus::default(),
            properties: payload.properties,
        },
    };
    envelope
        .system_data
        .touch(&ctx.client_identity, IdentityType::User, now);

    if let Some(validator) = &registered.validator {
        let validation = ValidationContext {
            deps,
            envelope: &envelope,
            existing: existing.as_ref(),
        };
        if let Err(detail) = validator.validate(&validation).await {
            return rest::error_response(detail);
        }
    }

    let precondition = match &ctx.if_match {
        Some(etag) => WritePrecondition::IfMatch(etag.clone()),
        None if ctx.if_none_match_any => WritePrecondition::MustNotExist,
        None => WritePrecondition::None,
    };
    if let Err(error) = deps
        .store
        .save_typed(&ctx.resource_id, &envelope, precondition)
        .await
    {
        return rest::error_response(store_error_detail(&error));
    }

    let body = match codec.from_internal(&envelope) {
        Ok(body) => body,
        Err(error) => return rest::error_response(conversion_error_detail(&error)),
    };

    if synchronous {
        return if is_new {
            (axum::http::StatusCode::CREATED, axum::Json(body)).into_response()
        } else {
            rest::ok(body)
        };
    }

    let kind = if is_new {
        OperationKind::Create
    } else {
        OperationKind::Update
    };
    let operation_id = match accept_operation(deps, ctx, kind).await {
        Ok(operation_id) => operation_id,
        Err(response) => return response,
    };

    let (status_url, result_url) = operation_urls(ctx, namespace_of(registered), operation_id);
    rest::accepted_async(is_new, body, &status_url, &result_url)
}

pub async fn get_resource(
    deps: &ControllerDeps,
    registered: &RegisteredType,
    ctx: &RequestContext,
) -> Response {
    let codec = match registered.codec(&ctx.api_version) {
        Ok(codec) => codec,
        Err(error) => return rest::error_response(conversion_error_detail(&error)),
    };

    let entry = match deps.store.get(&ctx.resource_id).await {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            return rest::error(
                ErrorCode::NotFound,
                format!("resource {} was not found", ctx.resource_id),
            );
        }
        Err(error) => return rest::error_response(store_error_detail(&error)),
    };
    let envelope = match typed_envelope(&entry) {
        Ok(envelope) => envelope,
        Err(response) => return response,
    };

    match codec.from_internal(&envelope) {
        Ok(body) => {
            let mut response = rest::ok(body);
            if let Ok(value) = axum::http::HeaderValue::from_str(entry.etag.as_str()) {
                response.headers_mut().insert(axum::http::header::ETAG, value);
            }
            response
        }
        Err(error) => rest::error_response(conversion_error_detail(&error)),
    }
}

pub async fn delete_resource(
    deps: &ControllerDeps,
    registered: &RegisteredType,
    ctx: &RequestContext,
) -> Response {
    let existing_entry = match deps.store.get(&ctx.resource_id).await {
        Ok(entry) => entry,
        Err(error) => return rest::error_response(store_error_detail(&error)),
    };
    let Some(entry) = existing_entry else {
        // Deleting what is not there is a success.
        return rest::no_content();
    };
    if let Some(if_match) = &ctx.if_match {
        if entry.etag != *if_match {
            return rest::error(
                ErrorCode::PreconditionFailed,
                "the provided ETag does not match the current resource",
            );
        }
    }

    let mut envelope = match typed_envelope(&entry) {
        Ok(envelope) => envelope,
        Err(response) => return response,
    };

    if let Some(validator) = &registered.validator {
        let validation = ValidationContext {
            deps,
            envelope: &envelope,
            existing: Some(&envelope),
        };
        if let Err(detail) = validator.validate_delete(&validation).await {
            return rest::error_response(detail);
        }
    }

    if registered.lifecycle == Lifecycle::Synchronous {
        let precondition = ctx
            .if_match
            .clone()
            .map_or(WritePrecondition::None, WritePrecondition::IfMatch);
        return match deps.store.delete(&ctx.resource_id, precondition).await {
            Ok(()) | Err(StoreError::NotFound { .. }) => rest::no_content(),
            Err(error) => rest::error_response(store_error_detail(&error)),
        };
    }

    // The document stays until the worker confirms teardown.
    envelope.provisioning_state = ProvisioningState::Deleting;
    envelope
        .system_data
        .touch(&ctx.client_identity, IdentityType::User, Utc::now());
    if let Err(error) = deps
        .store
        .save_typed(&ctx.resource_id, &envelope, WritePrecondition::IfMatch(entry.etag))
        .await
    {
        return rest::error_response(store_error_detail(&error));
    }

    let operation_id = match accept_operation(deps, ctx, OperationKind::Delete).await {
        Ok(operation_id) => operation_id,
        Err(response) => return response,
    };
    let (status_url, result_url) = operation_urls(ctx, namespace_of(registered), operation_id);
    rest::accepted_delete(&status_url, &result_url)
}

pub async fn list_resources(
    deps: &ControllerDeps,
    registered: &RegisteredType,
    ctx: &RequestContext,
    skip_token: Option<&str>,
) -> Response {
    let codec = match registered.codec(&ctx.api_version) {
        Ok(codec) => codec,
        Err(error) => return rest::error_response(conversion_error_detail(&error)),
    };

    let continuation = match skip_token.map(decode_skip_token).transpose() {
        Ok(continuation) => continuation,
        Err(()) => return rest::error(ErrorCode::Invalid, "the skipToken is not valid"),
    };

    let query = radius_store::Query {
        root_scope: ctx.resource_id.root_scope(),
        // Plane-scoped lists search every resource group below the plane.
        scope_recursive: ctx.resource_id.resource_group().is_none(),
        resource_type: Some(registered.qualified_type.clone()),
        continuation,
        limit: None,
    };

    let page = match deps.store.query(query).await {
        Ok(page) => page,
        Err(error) => return rest::error_response(store_error_detail(&error)),
    };

    let mut value = Vec::with_capacity(page.items.len());
    for entry in &page.items {
        let envelope = match typed_envelope(entry) {
            Ok(envelope) => envelope,
            Err(response) => return response,
        };
        match codec.from_internal(&envelope) {
            Ok(body) => value.push(body),
            Err(error) => return rest::error_response(conversion_error_detail(&error)),
        }
    }

    let mut body = json!({ "value": value });
    if let Some(token) = page.continuation {
        body["nextLink"] = json!(format!(
            "{}?api-version={}&skipToken={}",
            ctx.resource_id,
            ctx.api_version,
            encode_skip_token(&token)
        ));
    }
    rest::ok(body)
}

pub async fn invoke_action(
    deps: &ControllerDeps,
    registered: &RegisteredType,
    ctx: &RequestContext,
    action: &str,
) -> Response {
    let Some(handler) = registered.actions.get(&action.to_ascii_lowercase()) else {
        return rest::error(
            ErrorCode::NotFound,
            format!("action {action:?} is not supported on {}", registered.qualified_type),
        );
    };

    let entry = match deps.store.get(&ctx.resource_id).await {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            return rest::error(
                ErrorCode::NotFound,
                format!("resource {} was not found", ctx.resource_id),
            );
        }
        Err(error) => return rest::error_response(store_error_detail(&error)),
    };
    let envelope = match typed_envelope(&entry) {
        Ok(envelope) => envelope,
        Err(response) => return response,
    };

    match handler.invoke(deps, &envelope).await {
        Ok(body) => rest::ok(body),
        Err(detail) => rest::error_response(detail),
    }
}

/// Continuation tokens are storage keys; hex keeps them opaque and URL-safe.
fn encode_skip_token(token: &str) -> String {
    token.bytes().map(|byte| format!("{byte:02x}")).collect()
}

fn decode_skip_token(token: &str) -> Result<String, ()> {
    if token.len() % 2 != 0 {
        return Err(());
    }
    let bytes = (0..token.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&token[i..i + 2], 16).map_err(|_| ()))
        .collect::<Result<Vec<u8>, ()>>()?;
    String::from_utf8(bytes).map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_token_roundtrip() {
        let token = "/planes/radius/local/resourcegroups/rg1/providers/x/y/Z";
        let encoded = encode_skip_token(token);
        assert!(encoded.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(decode_skip_token(&encoded).unwrap(), token);
    }

    #[test]
    fn bad_skip_tokens_are_rejected() {
        assert!(decode_skip_token("xyz").is_err());
        assert!(decode_skip_token("0").is_err());
    }
}
