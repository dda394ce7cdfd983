//! The asynchronous operation queue.
//!
//! At-least-once delivery with visibility timeouts: a dequeued message stays
//! invisible for the lease duration and reappears if the consumer neither
//! completes nor extends it in time. Duplicate delivery after lease expiry
//! is part of the contract; the worker pool's per-resource mutual exclusion
//! is the only ordering mechanism above this.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use radius_resource::{OperationKind, ResourceId};
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use uuid::Uuid;

pub mod kubernetes;
pub mod memory;

pub use kubernetes::KubernetesQueue;
pub use memory::InMemoryQueue;

#[derive(Debug, Snafu)]
pub enum QueueError {
    #[snafu(display("message {message_id} is not in the queue"))]
    MessageNotFound { message_id: Uuid },

    #[snafu(display("lease on message {message_id} was lost to another consumer"))]
    LeaseLost { message_id: Uuid },

    #[snafu(display("failed to encode or decode the queue message"))]
    SerializeMessage { source: serde_json::Error },

    #[snafu(display("kubernetes request failed"))]
    Kubernetes { source: kube::Error },
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Kubernetes { source } => match source {
                kube::Error::Api(response) => {
                    response.code == 409 || response.code == 429 || response.code >= 500
                }
                kube::Error::HyperError(_) | kube::Error::Service(_) => true,
                _ => false,
            },
            _ => false,
        }
    }
}

/// One queued asynchronous operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMessage {
    pub message_id: Uuid,
    pub resource_id: ResourceId,
    pub operation_id: Uuid,
    pub kind: OperationKind,
    /// API version the triggering request used; carried so workers can
    /// answer in the same dialect when a collaborator needs one.
    pub api_version: String,
    pub enqueued_at: DateTime<Utc>,
    /// Number of times this message has been handed to a consumer,
    /// including the delivery it arrived with.
    #[serde(default)]
    pub dequeue_count: u32,
    /// Opaque payload for controller-specific data.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub body: serde_json::Value,
}

impl OperationMessage {
    pub fn new(
        resource_id: ResourceId,
        operation_id: Uuid,
        kind: OperationKind,
        api_version: &str,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            resource_id,
            operation_id,
            kind,
            api_version: api_version.to_owned(),
            enqueued_at: Utc::now(),
            dequeue_count: 0,
            body: serde_json::Value::Null,
        }
    }
}

/// Capability to settle a specific delivery of a message.
///
/// The receipt is regenerated on every dequeue; settling with a stale
/// receipt fails with [`QueueError::LeaseLost`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHandle {
    pub message_id: Uuid,
    pub(crate) receipt: Uuid,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Adds a message. Once this returns, the message is dequeuable; this is
    /// the commit point of the front-end's accept path.
    async fn enqueue(&self, message: OperationMessage) -> Result<(), QueueError>;

    /// Takes the next visible message, making it invisible for `lease`.
    /// Returns `None` when nothing is visible right now.
    async fn dequeue(
        &self,
        lease: Duration,
    ) -> Result<Option<(OperationMessage, MessageHandle)>, QueueError>;

    /// Pushes the visibility deadline of an in-flight message out by `lease`
    /// from now.
    async fn extend(&self, handle: &MessageHandle, lease: Duration) -> Result<(), QueueError>;

    /// Removes a message for good.
    async fn complete(&self, handle: &MessageHandle) -> Result<(), QueueError>;

    /// Returns a message to the queue. Visible immediately by default, or
    /// after `delay` for retry backoff.
    async fn abandon(
        &self,
        handle: &MessageHandle,
        delay: Option<Duration>,
    ) -> Result<(), QueueError>;
}
