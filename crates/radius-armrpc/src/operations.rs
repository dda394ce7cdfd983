//! Creation and lifecycle of operation status documents.

use chrono::Utc;
use radius_resource::{
    ErrorDetail, OperationKind, OperationStatus, ProvisioningState, ResourceId,
    operation::operation_status_id,
};
use radius_store::{StateStore, StateStoreExt, StoreError, WritePrecondition};
use std::sync::Arc;
use uuid::Uuid;

/// Default retention of terminal operation statuses.
pub const DEFAULT_RETENTION: chrono::Duration = chrono::Duration::minutes(30);

/// Manages operation status documents in the state store.
///
/// Statuses are plane-scoped documents keyed by operation ID. The manager is
/// the only writer besides the worker commit path.
#[derive(Clone)]
pub struct OperationStatusManager {
    store: Arc<dyn StateStore>,
    retention: chrono::Duration,
}

impl OperationStatusManager {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Creates an `Accepted` status for a freshly accepted operation.
    pub async fn create(
        &self,
        resource_id: ResourceId,
        kind: OperationKind,
    ) -> Result<OperationStatus, StoreError> {
        let status = OperationStatus::accepted(resource_id, kind, Utc::now());
        self.store
            .save_typed(
                &status.storage_id(),
                &status,
                WritePrecondition::MustNotExist,
            )
            .await?;
        Ok(status)
    }

    pub async fn get(
        &self,
        scope: &ResourceId,
        operation_id: Uuid,
    ) -> Result<Option<OperationStatus>, StoreError> {
        let id = operation_status_id(scope, operation_id);
        Ok(self
            .store
            .get_typed::<OperationStatus>(&id)
            .await?
            .map(|(status, _)| status))
    }

    /// Moves a status to a terminal state. Last writer wins: the per-resource
    /// lease guarantees a single worker owns the operation, and the
    /// cancellation path only touches already-abandoned operations.
    pub async fn complete(
        &self,
        mut status: OperationStatus,
        outcome: ProvisioningState,
        error: Option<ErrorDetail>,
    ) -> Result<OperationStatus, StoreError> {
        status.complete(outcome, error, Utc::now(), self.retention);
        self.store
            .save_typed(&status.storage_id(), &status, WritePrecondition::None)
            .await?;
        Ok(status)
    }

    /// Persists a non-terminal progress update.
    pub async fn update(&self, status: &OperationStatus) -> Result<(), StoreError> {
        self.store
            .save_typed(&status.storage_id(), status, WritePrecondition::None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use radius_store::InMemoryStateStore;

    use super::*;

    fn manager() -> OperationStatusManager {
        OperationStatusManager::new(Arc::new(InMemoryStateStore::new()))
    }

    fn resource_id() -> ResourceId {
        "/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/containers/web"
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn create_then_get_then_complete() {
        let manager = manager();
        let created = manager
            .create(resource_id(), OperationKind::Create)
            .await
            .unwrap();

        let fetched = manager
            .get(&resource_id(), created.operation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.status, ProvisioningState::Accepted);

        let completed = manager
            .complete(fetched, ProvisioningState::Succeeded, None)
            .await
            .unwrap();
        assert!(completed.is_terminal());

        let fetched = manager
            .get(&resource_id(), created.operation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.status, ProvisioningState::Succeeded);
        assert!(fetched.end_time.is_some());
    }

    #[tokio::test]
    async fn unknown_operation_is_none() {
        let manager = manager();
        let result = manager.get(&resource_id(), Uuid::new_v4()).await.unwrap();
        assert!(result.is_none());
    }
}
