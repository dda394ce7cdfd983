//! The asynchronous worker pool.
//!
//! A fixed-size set of workers consumes operation messages. For each message
//! the worker claims a per-resource lease (at most one concurrent
//! reconciliation per resource), runs the registered controller under a
//! deadline while a sibling task keeps the queue lease alive, then commits:
//! resource document first, operation status second, queue settlement last.
//! A crash between the two writes is recovered on redelivery by matching the
//! operation ID recorded on the document.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use radius_queue::{MessageHandle, MessageQueue, OperationMessage};
use radius_resource::{
    ErrorCode, ErrorDetail, OperationKind, OperationStatus, ProvisioningState, ResourceEnvelope,
    ResourceId, ResourceStatus,
};
use radius_store::{StateStoreExt, StoreError, WritePrecondition};
use rand::Rng;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::builder::{ControllerDeps, UcpRegistry};

/// Tuning knobs of the worker pool. Exposed through configuration; the
/// defaults suit a single-replica control plane.
#[derive(Clone, Copy, Debug)]
pub struct WorkerOptions {
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// Queue visibility lease per dequeue; extended while an operation runs.
    pub lease: Duration,
    /// Idle sleep between polls of an empty queue.
    pub poll_interval: Duration,
    /// Deliveries after which a message is poisoned into a failed operation.
    pub max_dequeue_count: u32,
    /// Base delay of the exponential retry backoff.
    pub retry_base: Duration,
    /// Ceiling of the retry backoff.
    pub retry_cap: Duration,
    /// Backoff when the per-resource lease is held by another operation.
    pub lock_retry_delay: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            lease: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            max_dequeue_count: 5,
            retry_base: Duration::from_secs(5),
            retry_cap: Duration::from_secs(600),
            lock_retry_delay: Duration::from_secs(2),
        }
    }
}

/// Everything a controller gets for one operation.
pub struct OperationContext {
    pub message: OperationMessage,
    /// The resource document as it was when the operation started.
    pub envelope: ResourceEnvelope<serde_json::Value>,
    /// Cancelled on shutdown, lease loss or timeout. Long-running work must
    /// observe it.
    pub cancellation: CancellationToken,
}

/// What a successful operation did.
pub enum OperationOutput {
    /// Properties and observed status to commit; provisioning state becomes
    /// `Succeeded`.
    Updated {
        properties: serde_json::Value,
        status: ResourceStatus,
    },
    /// The resource and everything it owned is gone.
    Deleted,
}

/// Outcome of one controller invocation. `Requeue` is an explicit value, not
/// an error: transient conditions come back through here.
pub enum ControllerResult {
    Success(OperationOutput),
    Failure {
        error: ErrorDetail,
        /// Outputs that did materialize before the failure, recorded so a
        /// later delete can clean them up.
        partial: Option<ResourceStatus>,
    },
    Requeue {
        /// Delay before redelivery; `None` lets the worker pick an
        /// exponential backoff from the dequeue count.
        after: Option<Duration>,
    },
    Cancelled,
}

/// A type-specific asynchronous operation (Create/Update/Delete executor).
#[async_trait]
pub trait AsyncController: Send + Sync {
    async fn run(&self, ctx: &OperationContext) -> ControllerResult;
}

/// In-process per-resource mutual exclusion.
#[derive(Clone, Default)]
pub struct ResourceLocks {
    held: Arc<Mutex<HashSet<ResourceId>>>,
}

pub struct ResourceLockGuard {
    id: ResourceId,
    held: Arc<Mutex<HashSet<ResourceId>>>,
}

impl ResourceLocks {
    pub fn try_acquire(&self, id: &ResourceId) -> Option<ResourceLockGuard> {
        let mut held = self.held.lock().ok()?;
        held.insert(id.clone()).then(|| ResourceLockGuard {
            id: id.clone(),
            held: Arc::clone(&self.held),
        })
    }
}

impl Drop for ResourceLockGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.id);
        }
    }
}

pub struct Worker {
    deps: ControllerDeps,
    registry: Arc<UcpRegistry>,
    options: WorkerOptions,
    locks: ResourceLocks,
}

impl Worker {
    pub fn new(deps: ControllerDeps, registry: Arc<UcpRegistry>, options: WorkerOptions) -> Self {
        Self {
            deps,
            registry,
            options,
            locks: ResourceLocks::default(),
        }
    }

    /// Runs the pool until `token` is cancelled, then drains in-flight
    /// operations.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut workers = JoinSet::new();
        for index in 0..self.options.concurrency.max(1) {
            let worker = Arc::clone(&self);
            let token = token.clone();
            workers.spawn(async move {
                tracing::debug!(index, "worker loop started");
                // An in-flight message is always settled before the loop
                // exits; shutdown reaches the controller through the child
                // token, never by dropping the processing future.
                while !token.is_cancelled() {
                    if !worker.poll_once(&token).await {
                        tokio::select! {
                            () = token.cancelled() => break,
                            () = tokio::time::sleep(worker.options.poll_interval) => {}
                        }
                    }
                }
                tracing::debug!(index, "worker loop stopped");
            });
        }
        while workers.join_next().await.is_some() {}
    }

    /// Dequeues and fully processes at most one message. Returns whether a
    /// message was handled; errors are settled against the queue internally.
    pub async fn poll_once(&self, token: &CancellationToken) -> bool {
        let dequeued = match self.deps.queue.dequeue(self.options.lease).await {
            Ok(dequeued) => dequeued,
            Err(error) => {
                tracing::warn!(%error, "failed to dequeue an operation message");
                return false;
            }
        };
        let Some((message, handle)) = dequeued else {
            return false;
        };

        let span = tracing::info_span!(
            "async_operation",
            resource_id = %message.resource_id,
            operation_id = %message.operation_id,
            kind = %message.kind,
            dequeue_count = message.dequeue_count,
        );
        self.process(message, handle, token).instrument(span).await;
        true
    }

    async fn process(&self, message: OperationMessage, handle: MessageHandle, token: &CancellationToken) {
        let resource_id = message.resource_id.clone();

        // Poison handling: a message past the ceiling becomes a failed
        // operation instead of looping forever.
        if message.dequeue_count > self.options.max_dequeue_count {
            tracing::warn!("operation exhausted its delivery budget");
            let error = ErrorDetail::new(
                ErrorCode::Exhausted,
                format!(
                    "the operation was delivered {} times without completing",
                    message.dequeue_count
                ),
            );
            self.finalize_failure(&message, &handle, error, None).await;
            return;
        }

        // Per-resource lease: exactly one reconciliation per resource.
        let Some(_guard) = self.locks.try_acquire(&resource_id) else {
            tracing::debug!("resource is busy, abandoning with backoff");
            let _ = self
                .deps
                .queue
                .abandon(&handle, Some(self.options.lock_retry_delay))
                .await;
            return;
        };

        let status = match self
            .deps
            .operations
            .get(&resource_id, message.operation_id)
            .await
        {
            Ok(Some(status)) => status,
            Ok(None) => {
                tracing::warn!("operation status is gone, dropping the message");
                let _ = self.deps.queue.complete(&handle).await;
                return;
            }
            Err(error) => {
                tracing::warn!(%error, "failed to load the operation status");
                let _ = self.deps.queue.abandon(&handle, Some(self.retry_delay(&message))).await;
                return;
            }
        };
        if status.is_terminal() {
            // Duplicate delivery after a completed commit.
            let _ = self.deps.queue.complete(&handle).await;
            return;
        }

        let envelope = match self.load_envelope(&message, &handle, &status).await {
            LoadOutcome::Ready(envelope) => envelope,
            LoadOutcome::Settled => return,
        };

        // Crash recovery: the document already carries this operation's
        // terminal result, only the status write was lost.
        if envelope.provisioning_state.is_terminal()
            && envelope.internal_metadata.async_operation_id == Some(message.operation_id)
        {
            let outcome = envelope.provisioning_state;
            let _ = self.deps.operations.complete(status, outcome, None).await;
            let _ = self.deps.queue.complete(&handle).await;
            return;
        }

        let Some(registered) = self
            .registry
            .resource_type(&envelope.resource_type)
            .cloned()
        else {
            let error = ErrorDetail::new(
                ErrorCode::Internal,
                format!("resource type {:?} has no registration", envelope.resource_type),
            );
            self.finalize_failure(&message, &handle, error, None).await;
            return;
        };
        let Some(controller) = registered.controllers.get(&message.kind).cloned() else {
            let error = ErrorDetail::new(
                ErrorCode::Internal,
                format!("no {} controller for {:?}", message.kind, envelope.resource_type),
            );
            self.finalize_failure(&message, &handle, error, None).await;
            return;
        };

        // Run the controller under its deadline while a sibling keeps the
        // queue lease alive. Both live under the same cancellation scope.
        let op_token = token.child_token();
        let keepalive = tokio::spawn(keep_alive(
            Arc::clone(&self.deps.queue),
            handle.clone(),
            self.options.lease,
            op_token.clone(),
        ));

        let ctx = OperationContext {
            message: message.clone(),
            envelope,
            cancellation: op_token.clone(),
        };
        let result = tokio::select! {
            () = op_token.cancelled() => ControllerResult::Cancelled,
            outcome = tokio::time::timeout(registered.timeout(), controller.run(&ctx)) => {
                outcome.unwrap_or_else(|_elapsed| ControllerResult::Failure {
                    error: ErrorDetail::new(
                        ErrorCode::OperationCanceled,
                        "the operation exceeded its deadline",
                    ),
                    partial: None,
                })
            }
        };

        op_token.cancel();
        let _ = keepalive.await;

        self.commit(ctx, handle, status, result).await;
    }

    async fn load_envelope(
        &self,
        message: &OperationMessage,
        handle: &MessageHandle,
        status: &OperationStatus,
    ) -> LoadOutcome {
        match self
            .deps
            .store
            .get_typed::<ResourceEnvelope<serde_json::Value>>(&message.resource_id)
            .await
        {
            Ok(Some((envelope, _etag))) => LoadOutcome::Ready(envelope),
            Ok(None) if message.kind == OperationKind::Delete => {
                // Nothing left to delete is a success.
                let _ = self
                    .deps
                    .operations
                    .complete(status.clone(), ProvisioningState::Succeeded, None)
                    .await;
                let _ = self.deps.queue.complete(handle).await;
                LoadOutcome::Settled
            }
            Ok(None) => {
                let error = ErrorDetail::new(
                    ErrorCode::NotFound,
                    format!("resource {} no longer exists", message.resource_id),
                );
                let _ = self
                    .deps
                    .operations
                    .complete(status.clone(), ProvisioningState::Failed, Some(error))
                    .await;
                let _ = self.deps.queue.complete(handle).await;
                LoadOutcome::Settled
            }
            Err(error) => {
                tracing::warn!(%error, "failed to load the resource document");
                let _ = self
                    .deps
                    .queue
                    .abandon(handle, Some(self.retry_delay(message)))
                    .await;
                LoadOutcome::Settled
            }
        }
    }

    /// Commit ordering is part of the crash-consistency contract: resource
    /// document first, operation status second, queue settlement last.
    async fn commit(
        &self,
        ctx: OperationContext,
        handle: MessageHandle,
        status: OperationStatus,
        result: ControllerResult,
    ) {
        let message = ctx.message;
        let mut envelope = ctx.envelope;

        let commit_result: Result<(), StoreError> = match result {
            ControllerResult::Success(OperationOutput::Updated { properties, status: observed }) => {
                envelope.properties = properties;
                envelope.status = observed;
                envelope.provisioning_state = ProvisioningState::Succeeded;
                envelope.internal_metadata.async_operation_id = Some(message.operation_id);
                match self
                    .deps
                    .store
                    .save_typed(&message.resource_id, &envelope, WritePrecondition::None)
                    .await
                {
                    Ok(_) => {
                        let _ = self
                            .deps
                            .operations
                            .complete(status, ProvisioningState::Succeeded, None)
                            .await;
                        let _ = self.deps.queue.complete(&handle).await;
                        tracing::info!("operation succeeded");
                        Ok(())
                    }
                    Err(error) => Err(error),
                }
            }
            ControllerResult::Success(OperationOutput::Deleted) => {
                match self
                    .deps
                    .store
                    .delete(&message.resource_id, WritePrecondition::None)
                    .await
                {
                    Ok(()) | Err(StoreError::NotFound { .. }) => {
                        let _ = self
                            .deps
                            .operations
                            .complete(status, ProvisioningState::Succeeded, None)
                            .await;
                        let _ = self.deps.queue.complete(&handle).await;
                        tracing::info!("resource deleted");
                        Ok(())
                    }
                    Err(error) => Err(error),
                }
            }
            ControllerResult::Failure { error, partial } => {
                tracing::warn!(code = %error.code, message = %error.message, "operation failed");
                if let Some(partial) = partial {
                    envelope.status = partial;
                }
                envelope.provisioning_state = ProvisioningState::Failed;
                envelope.internal_metadata.async_operation_id = Some(message.operation_id);
                match self
                    .deps
                    .store
                    .save_typed(&message.resource_id, &envelope, WritePrecondition::None)
                    .await
                {
                    Ok(_) => {
                        let _ = self
                            .deps
                            .operations
                            .complete(status, ProvisioningState::Failed, Some(error))
                            .await;
                        let _ = self.deps.queue.complete(&handle).await;
                        Ok(())
                    }
                    Err(store_error) => Err(store_error),
                }
            }
            ControllerResult::Requeue { after } => {
                let delay = after.unwrap_or_else(|| self.retry_delay(&message));
                tracing::debug!(?delay, "operation requeued");
                let _ = self.deps.queue.abandon(&handle, Some(delay)).await;
                Ok(())
            }
            ControllerResult::Cancelled => {
                // Shutdown or lease loss: hand the message back untouched so
                // the next delivery resumes the operation.
                let _ = self.deps.queue.abandon(&handle, None).await;
                Ok(())
            }
        };

        if let Err(error) = commit_result {
            tracing::warn!(%error, "commit failed, requeueing the operation");
            let _ = self
                .deps
                .queue
                .abandon(&handle, Some(self.retry_delay(&message)))
                .await;
        }
    }

    async fn finalize_failure(
        &self,
        message: &OperationMessage,
        handle: &MessageHandle,
        error: ErrorDetail,
        partial: Option<ResourceStatus>,
    ) {
        if let Ok(Some((mut envelope, _))) = self
            .deps
            .store
            .get_typed::<ResourceEnvelope<serde_json::Value>>(&message.resource_id)
            .await
        {
            if let Some(partial) = partial {
                envelope.status = partial;
            }
            envelope.provisioning_state = ProvisioningState::Failed;
            envelope.internal_metadata.async_operation_id = Some(message.operation_id);
            let _ = self
                .deps
                .store
                .save_typed(&message.resource_id, &envelope, WritePrecondition::None)
                .await;
        }
        if let Ok(Some(status)) = self
            .deps
            .operations
            .get(&message.resource_id, message.operation_id)
            .await
        {
            if !status.is_terminal() {
                let _ = self
                    .deps
                    .operations
                    .complete(status, ProvisioningState::Failed, Some(error))
                    .await;
            }
        }
        let _ = self.deps.queue.complete(handle).await;
    }

    /// Exponential backoff from the delivery count, jittered, capped.
    fn retry_delay(&self, message: &OperationMessage) -> Duration {
        let shift = message.dequeue_count.saturating_sub(1).min(16);
        let exp = self.options.retry_base.saturating_mul(1 << shift);
        let capped = exp.min(self.options.retry_cap);
        let jitter = rand::rng().random_range(0..=capped.as_millis() as u64 / 2);
        capped + Duration::from_millis(jitter)
    }
}

enum LoadOutcome {
    Ready(ResourceEnvelope<serde_json::Value>),
    Settled,
}

/// Extends the queue lease at half-lease cadence until cancelled. Losing the
/// lease cancels the operation scope; the message will redeliver.
async fn keep_alive(
    queue: Arc<dyn MessageQueue>,
    handle: MessageHandle,
    lease: Duration,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(lease / 2) => {
                if let Err(error) = queue.extend(&handle, lease).await {
                    tracing::warn!(%error, "failed to extend the message lease");
                    token.cancel();
                    return;
                }
            }
        }
    }
}
