//! Asynchronous operation bookkeeping: the status document clients poll and
//! the ARM error payload carried by failed operations and REST responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::{id::ResourceId, state::ProvisioningState};

/// Stable error codes surfaced to clients. These are wire contract, not Rust
/// type names; renaming a variant here is a breaking API change.
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Invalid,
    NotFound,
    Conflict,
    PreconditionFailed,
    Unauthorized,
    Forbidden,
    ResourceExhausted,
    Internal,
    DependencyFailure,
    RecipeNotFound,
    RecipeExecutionFailed,
    UnsupportedAPIVersion,
    PlaneNotFound,
    Exhausted,
    OperationCanceled,
}

/// ARM error payload: `{code, message, target?, details?[], innerError?}`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    /// JSON pointer into the submitted body, when the error is attributable
    /// to a specific field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<ErrorDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inner_error: Option<Box<ErrorDetail>>,
}

impl ErrorDetail {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_details(mut self, details: Vec<ErrorDetail>) -> Self {
        self.details = details;
        self
    }
}

/// What an async operation does to its resource.
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// The async progress record for a single resource operation.
///
/// Created by the front-end when an operation is accepted, moved to a
/// terminal state only by a worker or a cancellation path, and retained for
/// a bounded grace period afterwards so late polls still resolve.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    pub operation_id: Uuid,
    pub resource_id: ResourceId,
    pub kind: OperationKind,
    pub status: ProvisioningState,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent_complete: Option<f64>,
    /// Point in time after which the terminal record may be garbage
    /// collected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retain_until: Option<DateTime<Utc>>,
}

impl OperationStatus {
    pub fn accepted(resource_id: ResourceId, kind: OperationKind, now: DateTime<Utc>) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            resource_id,
            kind,
            status: ProvisioningState::Accepted,
            start_time: now,
            end_time: None,
            error: None,
            percent_complete: None,
            retain_until: None,
        }
    }

    /// Moves the operation into a terminal state. The retention window keeps
    /// the record available to polls that race the completion.
    pub fn complete(
        &mut self,
        status: ProvisioningState,
        error: Option<ErrorDetail>,
        now: DateTime<Utc>,
        retention: chrono::Duration,
    ) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.error = error;
        self.end_time = Some(now);
        self.retain_until = Some(now + retention);
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The ID the status document is stored under, scoped to the plane of
    /// the resource it tracks.
    pub fn storage_id(&self) -> ResourceId {
        operation_status_id(&self.resource_id, self.operation_id)
    }
}

/// Storage ID for an operation status: a `System.Resources/operationStatuses`
/// child of the plane scope, keyed by operation ID.
pub fn operation_status_id(resource_id: &ResourceId, operation_id: Uuid) -> ResourceId {
    resource_id
        .plane_scope()
        .child("operationStatuses", &operation_id.to_string())
}
