//! Queue driver persisting messages as custom resources.
//!
//! Every message is one `OperationQueueMessage` object. Claiming is a
//! compare-and-swap on the object's `resourceVersion`: the consumer that
//! loses the race gets a 409 from the API server and moves on to the next
//! visible message. This keeps the queue correct across multiple UCP
//! replicas without any coordinator.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::{
    Api, Client, CustomResource, ResourceExt,
    api::{DeleteParams, ListParams, PostParams},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use uuid::Uuid;

use crate::{
    KubernetesSnafu, MessageHandle, MessageQueue, OperationMessage, QueueError,
    SerializeMessageSnafu,
};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "ucp.radapp.io",
    version = "v1alpha1",
    kind = "OperationQueueMessage",
    plural = "operationqueuemessages",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct OperationQueueMessageSpec {
    /// The serialized [`OperationMessage`].
    pub message: serde_json::Value,
    /// Point in time the message becomes (or became) visible.
    pub next_visible_time: DateTime<Utc>,
    pub dequeue_count: u32,
    /// Receipt of the consumer currently holding the lease.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<String>,
}

pub struct KubernetesQueue {
    api: Api<OperationQueueMessage>,
}

impl KubernetesQueue {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    fn object_name(message_id: Uuid) -> String {
        format!("msg-{message_id}")
    }

    async fn get_leased(
        &self,
        handle: &MessageHandle,
    ) -> Result<OperationQueueMessage, QueueError> {
        let object = self
            .api
            .get_opt(&Self::object_name(handle.message_id))
            .await
            .context(KubernetesSnafu)?
            .ok_or(QueueError::MessageNotFound {
                message_id: handle.message_id,
            })?;
        if object.spec.receipt.as_deref() != Some(handle.receipt.to_string().as_str()) {
            return Err(QueueError::LeaseLost {
                message_id: handle.message_id,
            });
        }
        Ok(object)
    }

    /// Replace guarded by the resource version already present on `object`.
    /// A 409 means another consumer won; surfaced as [`QueueError::LeaseLost`].
    async fn checked_replace(
        &self,
        object: &OperationQueueMessage,
        message_id: Uuid,
    ) -> Result<(), QueueError> {
        self.api
            .replace(&object.name_any(), &PostParams::default(), object)
            .await
            .map_err(|error| match &error {
                kube::Error::Api(response) if response.code == 409 => {
                    QueueError::LeaseLost { message_id }
                }
                _ => QueueError::Kubernetes { source: error },
            })?;
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for KubernetesQueue {
    async fn enqueue(&self, message: OperationMessage) -> Result<(), QueueError> {
        let spec = OperationQueueMessageSpec {
            message: serde_json::to_value(&message).context(SerializeMessageSnafu)?,
            next_visible_time: Utc::now(),
            dequeue_count: message.dequeue_count,
            receipt: None,
        };
        let object = OperationQueueMessage::new(&Self::object_name(message.message_id), spec);
        self.api
            .create(&PostParams::default(), &object)
            .await
            .context(KubernetesSnafu)?;
        Ok(())
    }

    async fn dequeue(
        &self,
        lease: Duration,
    ) -> Result<Option<(OperationMessage, MessageHandle)>, QueueError> {
        let now = Utc::now();
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .context(KubernetesSnafu)?;

        for mut object in list.items {
            if object.spec.next_visible_time > now {
                continue;
            }

            let receipt = Uuid::new_v4();
            object.spec.next_visible_time = now
                + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(60));
            object.spec.dequeue_count += 1;
            object.spec.receipt = Some(receipt.to_string());

            let mut message: OperationMessage =
                serde_json::from_value(object.spec.message.clone())
                    .context(SerializeMessageSnafu)?;
            message.dequeue_count = object.spec.dequeue_count;

            let message_id = message.message_id;
            match self.checked_replace(&object, message_id).await {
                Ok(()) => {
                    return Ok(Some((
                        message,
                        MessageHandle {
                            message_id,
                            receipt,
                        },
                    )));
                }
                // Lost the claim race; try the next visible message.
                Err(QueueError::LeaseLost { .. }) => continue,
                Err(other) => return Err(other),
            }
        }

        Ok(None)
    }

    async fn extend(&self, handle: &MessageHandle, lease: Duration) -> Result<(), QueueError> {
        let mut object = self.get_leased(handle).await?;
        object.spec.next_visible_time = Utc::now()
            + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.checked_replace(&object, handle.message_id).await
    }

    async fn complete(&self, handle: &MessageHandle) -> Result<(), QueueError> {
        self.get_leased(handle).await?;
        self.api
            .delete(&Self::object_name(handle.message_id), &DeleteParams::default())
            .await
            .context(KubernetesSnafu)?;
        Ok(())
    }

    async fn abandon(
        &self,
        handle: &MessageHandle,
        delay: Option<Duration>,
    ) -> Result<(), QueueError> {
        let mut object = self.get_leased(handle).await?;
        let delay = delay.unwrap_or_default();
        object.spec.next_visible_time = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        object.spec.receipt = None;
        self.checked_replace(&object, handle.message_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names_are_stable() {
        let id = Uuid::new_v4();
        assert_eq!(KubernetesQueue::object_name(id), format!("msg-{id}"));
    }
}
