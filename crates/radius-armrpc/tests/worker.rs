//! Worker pool tests: commit ordering, retries, poisoning, per-resource
//! serialization and crash recovery.

mod common;

use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, header},
};
use common::{Harness, Step, async_uri, thing_body};
use radius_armrpc::WorkerOptions;
use radius_resource::{ProvisioningState, ResourceEnvelope, ResourceId};
use radius_queue::MessageQueue;
use radius_store::StateStoreExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn thing_id(name: &str) -> ResourceId {
    format!(
        "/planes/radius/local/resourceGroups/rg1/providers/Applications.Test/asyncthings/{name}"
    )
    .parse()
    .unwrap()
}

async fn put(harness: &Harness, name: &str) {
    let request = Request::builder()
        .method("PUT")
        .uri(async_uri(name))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(thing_body()))
        .expect("request");
    let response = harness
        .router
        .clone()
        .oneshot(request)
        .await
        .expect("infallible");
    assert!(response.status().is_success(), "{}", response.status());
}

async fn delete(harness: &Harness, name: &str) {
    let request = Request::builder()
        .method("DELETE")
        .uri(async_uri(name))
        .body(Body::empty())
        .expect("request");
    let response = harness
        .router
        .clone()
        .oneshot(request)
        .await
        .expect("infallible");
    assert!(response.status().is_success(), "{}", response.status());
}

async fn envelope(
    harness: &Harness,
    name: &str,
) -> Option<ResourceEnvelope<serde_json::Value>> {
    harness
        .deps
        .store
        .get_typed::<ResourceEnvelope<serde_json::Value>>(&thing_id(name))
        .await
        .unwrap()
        .map(|(envelope, _)| envelope)
}

fn fast_options() -> WorkerOptions {
    WorkerOptions {
        retry_base: Duration::from_millis(10),
        lock_retry_delay: Duration::from_millis(10),
        ..WorkerOptions::default()
    }
}

#[tokio::test]
async fn create_commits_resource_then_status_then_queue() {
    let harness = Harness::new(vec![Step::Succeed]);
    let worker = harness.worker(fast_options());
    put(&harness, "w").await;

    assert!(worker.poll_once(&CancellationToken::new()).await);

    let envelope = envelope(&harness, "w").await.unwrap();
    assert_eq!(envelope.provisioning_state, ProvisioningState::Succeeded);
    assert_eq!(envelope.status.output_resources.len(), 1);
    assert!(envelope.internal_metadata.async_operation_id.is_some());

    let operation_id = envelope.internal_metadata.async_operation_id.unwrap();
    let status = harness
        .deps
        .operations
        .get(&thing_id("w"), operation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, ProvisioningState::Succeeded);
    assert!(status.end_time.is_some());

    assert!(harness.queue.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_requeues_then_succeeds() {
    let harness = Harness::new(vec![Step::Requeue(Duration::from_secs(5)), Step::Succeed]);
    let worker = harness.worker(fast_options());
    let token = CancellationToken::new();
    put(&harness, "w").await;

    // First delivery: requeued with a delay, resource untouched.
    assert!(worker.poll_once(&token).await);
    assert_eq!(
        envelope(&harness, "w").await.unwrap().provisioning_state,
        ProvisioningState::Accepted
    );
    assert_eq!(harness.queue.len().await, 1);
    assert!(!worker.poll_once(&token).await, "message must be invisible");

    // After the backoff the retry succeeds.
    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(worker.poll_once(&token).await);
    let envelope = envelope(&harness, "w").await.unwrap();
    assert_eq!(envelope.provisioning_state, ProvisioningState::Succeeded);
    assert_eq!(envelope.status.output_resources.len(), 1);
    assert!(harness.queue.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn exhausted_deliveries_poison_the_operation() {
    let harness = Harness::new(vec![
        Step::Requeue(Duration::from_millis(1)),
        Step::Succeed,
    ]);
    let worker = harness.worker(WorkerOptions {
        max_dequeue_count: 1,
        ..fast_options()
    });
    let token = CancellationToken::new();
    put(&harness, "w").await;

    assert!(worker.poll_once(&token).await);
    tokio::time::advance(Duration::from_millis(5)).await;

    // Second delivery exceeds the ceiling and is poisoned.
    assert!(worker.poll_once(&token).await);
    let envelope = envelope(&harness, "w").await.unwrap();
    assert_eq!(envelope.provisioning_state, ProvisioningState::Failed);

    let operation_id = envelope.internal_metadata.async_operation_id.unwrap();
    let status = harness
        .deps
        .operations
        .get(&thing_id("w"), operation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, ProvisioningState::Failed);
    assert_eq!(status.error.unwrap().code, "Exhausted");
    assert!(harness.queue.is_empty().await);
}

#[tokio::test]
async fn permanent_failure_is_terminal() {
    let harness = Harness::new(vec![Step::Fail("template rejected".into())]);
    let worker = harness.worker(fast_options());
    put(&harness, "w").await;

    assert!(worker.poll_once(&CancellationToken::new()).await);
    let envelope = envelope(&harness, "w").await.unwrap();
    assert_eq!(envelope.provisioning_state, ProvisioningState::Failed);

    let operation_id = envelope.internal_metadata.async_operation_id.unwrap();
    let status = harness
        .deps
        .operations
        .get(&thing_id("w"), operation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.error.unwrap().code, "RecipeExecutionFailed");
    assert!(harness.queue.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn delete_during_create_serializes_on_the_resource_lease() {
    let harness = Harness::new(vec![Step::Block]);
    let worker = harness.worker(fast_options());
    let token = CancellationToken::new();

    put(&harness, "w").await;
    delete(&harness, "w").await;
    assert_eq!(harness.queue.len().await, 2);

    // First worker picks up the create and blocks inside the controller.
    let create_worker = {
        let worker = worker.clone();
        let token = token.clone();
        tokio::spawn(async move { worker.poll_once(&token).await })
    };
    tokio::task::yield_now().await;

    // Second worker sees the delete but the resource lease is held.
    assert!(worker.poll_once(&token).await);
    assert!(
        envelope(&harness, "w").await.is_some(),
        "delete must not run while create holds the lease"
    );

    // Unblock the create; it commits Succeeded.
    harness.release();
    assert!(create_worker.await.unwrap());
    assert_eq!(
        envelope(&harness, "w").await.unwrap().provisioning_state,
        ProvisioningState::Succeeded
    );

    // The delete redelivers after the lock backoff and removes the resource.
    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(worker.poll_once(&token).await);
    assert!(envelope(&harness, "w").await.is_none());
    assert!(harness.queue.is_empty().await);
}

#[tokio::test]
async fn duplicate_delivery_after_commit_is_dropped() {
    let harness = Harness::new(vec![Step::Succeed]);
    let worker = harness.worker(fast_options());
    put(&harness, "w").await;

    // Simulate redelivery: a second message for the same operation.
    let envelope_before = envelope(&harness, "w").await.unwrap();
    assert_eq!(envelope_before.provisioning_state, ProvisioningState::Accepted);

    assert!(worker.poll_once(&CancellationToken::new()).await);
    assert!(harness.queue.is_empty().await);

    // Re-enqueue the already-completed operation by hand.
    let operation_id = envelope(&harness, "w")
        .await
        .unwrap()
        .internal_metadata
        .async_operation_id
        .unwrap();
    harness
        .deps
        .queue
        .enqueue(radius_queue::OperationMessage::new(
            thing_id("w"),
            operation_id,
            radius_resource::OperationKind::Create,
            common::API_VERSION,
        ))
        .await
        .unwrap();

    assert!(worker.poll_once(&CancellationToken::new()).await);
    assert!(harness.queue.is_empty().await);
    assert_eq!(
        envelope(&harness, "w").await.unwrap().provisioning_state,
        ProvisioningState::Succeeded
    );
}

#[tokio::test]
async fn shutdown_cancellation_abandons_for_redelivery() {
    let harness = Harness::new(vec![Step::Block, Step::Succeed]);
    let worker = harness.worker(fast_options());
    let token = CancellationToken::new();
    put(&harness, "w").await;

    let poll = {
        let worker = worker.clone();
        let token = token.clone();
        tokio::spawn(async move { worker.poll_once(&token).await })
    };
    tokio::task::yield_now().await;

    token.cancel();
    assert!(poll.await.unwrap());

    // The message is visible again and the resource is untouched.
    assert_eq!(harness.queue.len().await, 1);
    assert_eq!(
        envelope(&harness, "w").await.unwrap().provisioning_state,
        ProvisioningState::Accepted
    );

    // A fresh worker finishes the job.
    assert!(worker.poll_once(&CancellationToken::new()).await);
    assert_eq!(
        envelope(&harness, "w").await.unwrap().provisioning_state,
        ProvisioningState::Succeeded
    );
}
