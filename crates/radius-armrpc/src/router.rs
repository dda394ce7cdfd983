//! Plane-aware dispatch of the ARM wire surface.
//!
//! ARM paths are case-insensitive in every structural segment, which rules
//! out a literal axum route table. The router instead owns a fallback
//! handler that parses the path into a [`ResourceId`] and dispatches on the
//! parsed plane, type and verb against the registry built in
//! [`crate::builder`]. Collisions are caught there at build time.

use std::{collections::HashMap, str::FromStr, sync::Arc};

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use radius_resource::{
    ErrorCode, ErrorDetail, OperationKind, ProvisioningState, ResourceEnvelope, ResourceId,
};
use radius_store::{Query, WritePrecondition};
use serde_json::json;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::{
    builder::{ControllerDeps, UcpRegistry},
    context::RequestContext,
    frontend,
    rest::{self, CORRELATION_ID},
};

const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;
const RESOURCE_GROUP_TYPE: &str = "System.Resources/resourceGroups";

#[derive(Clone)]
pub(crate) struct AppState {
    pub registry: Arc<UcpRegistry>,
    pub deps: ControllerDeps,
}

/// Builds the UCP HTTP surface: health endpoints plus the plane dispatcher.
pub fn ucp_router(registry: Arc<UcpRegistry>, deps: ControllerDeps) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(healthz))
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { registry, deps })
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    query
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_owned(), value.to_owned()))
        })
        .collect()
}

async fn dispatch(State(state): State<AppState>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_owned();
    let query = parse_query(parts.uri.query());
    let api_version = query.get("api-version").map(String::as_str);

    let correlation = parts.headers.get(&CORRELATION_ID).cloned();
    let mut response = route(&state, &parts, body, &path, api_version, &query).await;
    if let Some(correlation) = correlation {
        response.headers_mut().insert(CORRELATION_ID, correlation);
    }
    response
}

#[allow(clippy::too_many_lines)]
async fn route(
    state: &AppState,
    parts: &axum::http::request::Parts,
    body: Body,
    path: &str,
    api_version: Option<&str>,
    query: &HashMap<String, String>,
) -> Response {
    // `/planes/{kind}/{name}/resourceGroups` does not parse as an ID; it is
    // the resource group collection.
    if let Some(plane) = resource_group_collection(path) {
        if !state.registry.has_plane(plane.plane_kind()) {
            return plane_not_found(&plane);
        }
        return if parts.method == Method::GET {
            list_resource_groups(state, &plane).await
        } else {
            method_not_allowed()
        };
    }

    let Ok(id) = ResourceId::parse(path) else {
        return rest::error(
            ErrorCode::NotFound,
            format!("the request path {path:?} is not a valid resource id"),
        );
    };

    if !state.registry.has_plane(id.plane_kind()) {
        return plane_not_found(&id);
    }

    if id.is_scope() {
        return dispatch_scope(state, parts, body, id).await;
    }

    // Operation status and result endpoints sit under
    // `/providers/{ns}/locations/{location}/operation{Statuses,Results}/{id}`.
    let segments = id.type_segments();
    if let Some(last) = segments.last() {
        let kind = last.name.to_ascii_lowercase();
        if kind == "operationstatuses" || kind == "operationresults" {
            if parts.method != Method::GET {
                return method_not_allowed();
            }
            let Some(operation_id) = last.instance.as_deref().and_then(|raw| Uuid::from_str(raw).ok())
            else {
                return rest::error(ErrorCode::NotFound, "the operation id is not a valid uuid");
            };
            return if kind == "operationstatuses" {
                get_operation_status(state, &id, operation_id).await
            } else {
                get_operation_result(state, &id, operation_id, api_version).await
            };
        }
    }

    // POST to `{instance}/{action}` invokes a custom action on the instance.
    if parts.method == Method::POST && id.is_collection() && segments.len() >= 2 {
        let action = segments[segments.len() - 1].name.clone();
        let Some(target) = id.parent() else {
            return method_not_allowed();
        };
        return run_action(state, parts, target, &action, api_version).await;
    }

    let Some(qualified_type) = id.qualified_type() else {
        return rest::error(ErrorCode::NotFound, "the request path has no resource type");
    };
    let Some(registered) = state.registry.resource_type(&qualified_type).cloned() else {
        return rest::error(
            ErrorCode::NotFound,
            format!("the resource type {qualified_type:?} is not registered"),
        );
    };

    let ctx = match RequestContext::new(id.clone(), api_version, &parts.headers) {
        Ok(ctx) => ctx,
        Err(detail) => return rest::error_response(detail),
    };

    match (parts.method.as_str(), id.is_collection()) {
        ("GET", true) => {
            let skip_token = query.get("skipToken").map(String::as_str);
            frontend::list_resources(&state.deps, &registered, &ctx, skip_token).await
        }
        ("GET", false) => frontend::get_resource(&state.deps, &registered, &ctx).await,
        ("PUT", false) => match read_body(body).await {
            Ok(bytes) => frontend::put_resource(&state.deps, &registered, &ctx, &bytes).await,
            Err(response) => response,
        },
        ("PATCH", false) => match read_body(body).await {
            Ok(bytes) => patch_resource(state, &registered, &ctx, &bytes).await,
            Err(response) => response,
        },
        ("DELETE", false) => {
            frontend::delete_resource(&state.deps, &registered, &ctx).await
        }
        _ => method_not_allowed(),
    }
}

fn plane_not_found(id: &ResourceId) -> Response {
    rest::error_response(ErrorDetail::new(
        ErrorCode::PlaneNotFound,
        format!("the plane {:?} is not hosted by this instance", id.plane_kind()),
    ))
}

fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        axum::Json(crate::rest::ArmErrorBody {
            error: ErrorDetail::new(ErrorCode::Invalid, "the method is not supported on this route"),
        }),
    )
        .into_response()
}

async fn read_body(body: Body) -> Result<axum::body::Bytes, Response> {
    axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| rest::error(ErrorCode::Invalid, "failed to read the request body"))
}

/// PATCH is a merge over the current wire rendering followed by the regular
/// PUT path, so validators and the async pipeline see a full document.
async fn patch_resource(
    state: &AppState,
    registered: &Arc<crate::builder::RegisteredType>,
    ctx: &RequestContext,
    patch: &[u8],
) -> Response {
    let codec = match registered.codec(&ctx.api_version) {
        Ok(codec) => codec,
        Err(_) => {
            return rest::error(
                ErrorCode::UnsupportedAPIVersion,
                format!("api version {:?} is not supported", ctx.api_version),
            );
        }
    };

    let existing = match state.deps.store.get(&ctx.resource_id).await {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            return rest::error(
                ErrorCode::NotFound,
                format!("resource {} was not found", ctx.resource_id),
            );
        }
        Err(error) => {
            return rest::error_response(frontend::store_error_detail(&error));
        }
    };
    let envelope = match existing.to_typed::<ResourceEnvelope<serde_json::Value>>() {
        Ok(envelope) => envelope,
        Err(error) => return rest::error_response(frontend::store_error_detail(&error)),
    };

    let mut merged = match codec.from_internal(&envelope) {
        Ok(rendered) => rendered,
        Err(_) => return rest::error(ErrorCode::Internal, "failed to render the stored resource"),
    };
    let patch: serde_json::Value = match serde_json::from_slice(patch) {
        Ok(patch) => patch,
        Err(_) => return rest::error(ErrorCode::Invalid, "the patch body is not valid JSON"),
    };
    merge_json(&mut merged, patch);

    let body = match serde_json::to_vec(&merged) {
        Ok(body) => body,
        Err(_) => return rest::error(ErrorCode::Internal, "failed to serialize the merged body"),
    };
    frontend::put_resource(&state.deps, registered, ctx, &body).await
}

/// RFC 7386 style merge: objects merge recursively, null deletes, anything
/// else replaces.
fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    base.remove(&key);
                } else {
                    merge_json(base.entry(key).or_insert(serde_json::Value::Null), value);
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

async fn run_action(
    state: &AppState,
    parts: &axum::http::request::Parts,
    target: ResourceId,
    action: &str,
    api_version: Option<&str>,
) -> Response {
    let Some(qualified_type) = target.qualified_type() else {
        return rest::error(ErrorCode::NotFound, "the request path has no resource type");
    };
    let Some(registered) = state.registry.resource_type(&qualified_type).cloned() else {
        return rest::error(
            ErrorCode::NotFound,
            format!("the resource type {qualified_type:?} is not registered"),
        );
    };
    let ctx = match RequestContext::new(target, api_version, &parts.headers) {
        Ok(ctx) => ctx,
        Err(detail) => return rest::error_response(detail),
    };
    frontend::invoke_action(&state.deps, &registered, &ctx, action).await
}

// ── Operation status endpoints ──────────────────────────────────────────────

async fn get_operation_status(
    state: &AppState,
    scope: &ResourceId,
    operation_id: Uuid,
) -> Response {
    match state.deps.operations.get(scope, operation_id).await {
        Ok(Some(status)) => rest::ok(json!({
            "id": format!("{}/providers/System.Resources/operationStatuses/{operation_id}", scope.plane_scope()),
            "name": operation_id,
            "status": status.status,
            "startTime": status.start_time,
            "endTime": status.end_time,
            "error": status.error,
            "percentComplete": status.percent_complete,
        })),
        Ok(None) => rest::error(
            ErrorCode::NotFound,
            format!("operation {operation_id} was not found"),
        ),
        Err(error) => rest::error_response(frontend::store_error_detail(&error)),
    }
}

async fn get_operation_result(
    state: &AppState,
    scope: &ResourceId,
    operation_id: Uuid,
    api_version: Option<&str>,
) -> Response {
    let status = match state.deps.operations.get(scope, operation_id).await {
        Ok(Some(status)) => status,
        Ok(None) => {
            return rest::error(
                ErrorCode::NotFound,
                format!("operation {operation_id} was not found"),
            );
        }
        Err(error) => return rest::error_response(frontend::store_error_detail(&error)),
    };

    if !status.is_terminal() {
        return StatusCode::ACCEPTED.into_response();
    }

    match status.status {
        ProvisioningState::Succeeded if status.kind == OperationKind::Delete => {
            StatusCode::NO_CONTENT.into_response()
        }
        ProvisioningState::Succeeded => {
            let Some(qualified_type) = status.resource_id.qualified_type() else {
                return StatusCode::NO_CONTENT.into_response();
            };
            let Some(registered) = state.registry.resource_type(&qualified_type).cloned() else {
                return StatusCode::NO_CONTENT.into_response();
            };
            let ctx = match RequestContext::new(
                status.resource_id.clone(),
                api_version,
                &axum::http::HeaderMap::new(),
            ) {
                Ok(ctx) => ctx,
                Err(detail) => return rest::error_response(detail),
            };
            frontend::get_resource(&state.deps, &registered, &ctx).await
        }
        _ => rest::error_response(status.error.unwrap_or_else(|| {
            ErrorDetail::new(ErrorCode::Internal, "the operation failed without detail")
        })),
    }
}

// ── Resource group scope documents ──────────────────────────────────────────

/// `/planes/{kind}/{name}/resourceGroups` (which is not a parseable ID).
fn resource_group_collection(path: &str) -> Option<ResourceId> {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    let (parent, last) = trimmed.rsplit_once('/')?;
    if !last.eq_ignore_ascii_case("resourceGroups") {
        return None;
    }
    let plane = ResourceId::parse(parent).ok()?;
    (plane.is_scope() && plane.scopes().is_empty()).then_some(plane)
}

/// Scope documents are persisted under a `System.Resources` provider ID so
/// they never collide with resources stored inside the scope.
fn scope_storage_id(id: &ResourceId) -> Option<ResourceId> {
    let scope = id.scopes().first()?;
    if !scope.key.eq_ignore_ascii_case("resourceGroups") {
        return None;
    }
    Some(id.plane_scope().child("resourceGroups", &scope.name))
}

fn scope_wire_body(id: &ResourceId) -> serde_json::Value {
    json!({
        "id": id.to_string(),
        "name": id.scopes().first().map(|scope| scope.name.clone()),
        "type": RESOURCE_GROUP_TYPE,
    })
}

async fn dispatch_scope(
    state: &AppState,
    parts: &axum::http::request::Parts,
    _body: Body,
    id: ResourceId,
) -> Response {
    if id.scopes().is_empty() {
        // The plane root itself answers GET with a descriptor.
        return if parts.method == Method::GET {
            rest::ok(json!({
                "id": id.to_string(),
                "name": id.plane_name(),
                "type": "System.Planes/planes",
            }))
        } else {
            method_not_allowed()
        };
    }

    let Some(storage_id) = scope_storage_id(&id) else {
        return rest::error(
            ErrorCode::NotFound,
            format!("the scope {id} is not supported"),
        );
    };

    match parts.method.as_str() {
        "PUT" => {
            let created = match state.deps.store.get(&storage_id).await {
                Ok(existing) => existing.is_none(),
                Err(error) => return rest::error_response(frontend::store_error_detail(&error)),
            };
            let document = scope_wire_body(&id);
            if let Err(error) = state
                .deps
                .store
                .save(&storage_id, document.clone(), WritePrecondition::None)
                .await
            {
                return rest::error_response(frontend::store_error_detail(&error));
            }
            let status = if created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (status, axum::Json(document)).into_response()
        }
        "GET" => match state.deps.store.get(&storage_id).await {
            Ok(Some(entry)) => rest::ok(entry.data),
            Ok(None) => rest::error(
                ErrorCode::NotFound,
                format!("resource group {id} was not found"),
            ),
            Err(error) => rest::error_response(frontend::store_error_detail(&error)),
        },
        "DELETE" => {
            // A scope with resources in it cannot be deleted.
            let query = Query {
                root_scope: id.to_string(),
                scope_recursive: true,
                resource_type: None,
                continuation: None,
                limit: Some(1),
            };
            match state.deps.store.query(query).await {
                Ok(page) if !page.items.is_empty() => rest::error(
                    ErrorCode::Conflict,
                    format!("resource group {id} still contains resources"),
                ),
                Ok(_) => match state
                    .deps
                    .store
                    .delete(&storage_id, WritePrecondition::None)
                    .await
                {
                    Ok(())
                    | Err(radius_store::StoreError::NotFound { .. }) => rest::no_content(),
                    Err(error) => rest::error_response(frontend::store_error_detail(&error)),
                },
                Err(error) => rest::error_response(frontend::store_error_detail(&error)),
            }
        }
        _ => method_not_allowed(),
    }
}

async fn list_resource_groups(state: &AppState, plane: &ResourceId) -> Response {
    let query = Query {
        root_scope: plane.to_string(),
        scope_recursive: false,
        resource_type: Some(RESOURCE_GROUP_TYPE.to_owned()),
        continuation: None,
        limit: Some(usize::MAX),
    };
    match state.deps.store.query(query).await {
        Ok(page) => {
            let value: Vec<_> = page.items.into_iter().map(|entry| entry.data).collect();
            rest::ok(json!({ "value": value }))
        }
        Err(error) => rest::error_response(frontend::store_error_detail(&error)),
    }
}
