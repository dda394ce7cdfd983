//! The ARM wire error model and response helpers.

use axum::{
    Json,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use radius_resource::{ErrorCode, ErrorDetail};
use serde::{Deserialize, Serialize};

/// `Azure-AsyncOperation` header carrying the operation status URL.
pub const AZURE_ASYNC_OPERATION: HeaderName = HeaderName::from_static("azure-asyncoperation");
/// Correlation ID clients may send; echoed back on every response.
pub const CORRELATION_ID: HeaderName = HeaderName::from_static("x-ms-correlation-request-id");

/// Error body shape: `{"error": {"code": ..., "message": ..., ...}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArmErrorBody {
    pub error: ErrorDetail,
}

/// HTTP status a stable error code maps to.
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Invalid | ErrorCode::UnsupportedAPIVersion => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound | ErrorCode::PlaneNotFound => StatusCode::NOT_FOUND,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Internal
        | ErrorCode::DependencyFailure
        | ErrorCode::RecipeExecutionFailed
        | ErrorCode::Exhausted
        | ErrorCode::OperationCanceled => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::RecipeNotFound => StatusCode::BAD_REQUEST,
    }
}

/// An error response with the proper status for its code.
pub fn error_response(detail: ErrorDetail) -> Response {
    let status = detail
        .code
        .parse::<ErrorCode>()
        .map_or(StatusCode::INTERNAL_SERVER_ERROR, status_for);
    (status, Json(ArmErrorBody { error: detail })).into_response()
}

pub fn error(code: ErrorCode, message: impl Into<String>) -> Response {
    error_response(ErrorDetail::new(code, message))
}

/// 200 with a JSON body.
pub fn ok(body: serde_json::Value) -> Response {
    Json(body).into_response()
}

/// 201/202 for an accepted asynchronous operation: the body reflects the
/// persisted desired state, the headers point at the operation status and
/// result URLs.
pub fn accepted_async(
    created: bool,
    body: serde_json::Value,
    status_url: &str,
    result_url: &str,
) -> Response {
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::ACCEPTED
    };

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(status_url) {
        headers.insert(AZURE_ASYNC_OPERATION, value);
    }
    if let Ok(value) = HeaderValue::from_str(result_url) {
        headers.insert(header::LOCATION, value);
    }

    (status, headers, Json(body)).into_response()
}

/// 202 for an accepted delete.
pub fn accepted_delete(status_url: &str, result_url: &str) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(status_url) {
        headers.insert(AZURE_ASYNC_OPERATION, value);
    }
    if let Ok(value) = HeaderValue::from_str(result_url) {
        headers.insert(header::LOCATION, value);
    }
    (StatusCode::ACCEPTED, headers).into_response()
}

pub fn no_content() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(ErrorCode::Invalid, StatusCode::BAD_REQUEST)]
    #[case(ErrorCode::UnsupportedAPIVersion, StatusCode::BAD_REQUEST)]
    #[case(ErrorCode::NotFound, StatusCode::NOT_FOUND)]
    #[case(ErrorCode::PreconditionFailed, StatusCode::PRECONDITION_FAILED)]
    #[case(ErrorCode::Conflict, StatusCode::CONFLICT)]
    #[case(ErrorCode::Internal, StatusCode::INTERNAL_SERVER_ERROR)]
    fn status_mapping(#[case] code: ErrorCode, #[case] status: StatusCode) {
        assert_eq!(status_for(code), status);
    }

    #[test]
    fn error_body_shape() {
        let body = ArmErrorBody {
            error: ErrorDetail::new(ErrorCode::NotFound, "gone"),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"]["code"], "NotFound");
        assert_eq!(json["error"]["message"], "gone");
    }
}
