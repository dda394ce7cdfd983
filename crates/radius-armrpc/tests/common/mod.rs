//! Shared harness: an in-memory control plane with one synchronous and one
//! asynchronous test resource type.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::Router;
use radius_armrpc::{
    AsyncController, ControllerResult, OperationContext, OperationOutput, OperationStatusManager,
    ResourceProviderBuilder, ResourceType, UcpRouterBuilder, Worker, WorkerOptions,
    builder::{ControllerDeps, UcpRegistry},
    convert::{ApiModel, ConversionError},
};
use radius_queue::InMemoryQueue;
use radius_resource::{
    ErrorCode, ErrorDetail, OperationKind, OutputResource, ResourceStatus,
};
use radius_store::{InMemorySecretStore, InMemoryStateStore};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

pub const API_VERSION: &str = "2023-10-01-preview";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThingProperties {
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

pub struct ThingV20231001;

impl ApiModel for ThingV20231001 {
    type WireProperties = ThingProperties;
    type Properties = ThingProperties;

    fn properties_to_internal(
        wire: ThingProperties,
    ) -> Result<ThingProperties, ConversionError> {
        Ok(wire)
    }

    fn properties_from_internal(
        internal: &ThingProperties,
    ) -> Result<ThingProperties, ConversionError> {
        Ok(internal.clone())
    }
}

/// One scripted step of a test controller.
pub enum Step {
    Succeed,
    Fail(String),
    Requeue(Duration),
    /// Block until [`Harness::release`] is called, then succeed.
    Block,
}

pub struct ScriptedController {
    script: Mutex<VecDeque<Step>>,
    gate: Arc<Notify>,
}

impl ScriptedController {
    fn new(script: Vec<Step>, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            gate,
        })
    }
}

#[async_trait]
impl AsyncController for ScriptedController {
    async fn run(&self, ctx: &OperationContext) -> ControllerResult {
        let step = self.script.lock().await.pop_front().unwrap_or(Step::Succeed);
        match step {
            Step::Succeed => {}
            Step::Fail(message) => {
                return ControllerResult::Failure {
                    error: ErrorDetail::new(ErrorCode::RecipeExecutionFailed, message),
                    partial: None,
                };
            }
            Step::Requeue(after) => {
                return ControllerResult::Requeue { after: Some(after) };
            }
            Step::Block => {
                tokio::select! {
                    () = self.gate.notified() => {}
                    () = ctx.cancellation.cancelled() => return ControllerResult::Cancelled,
                }
            }
        }

        if ctx.message.kind == OperationKind::Delete {
            ControllerResult::Success(OperationOutput::Deleted)
        } else {
            let mut status = ResourceStatus::default();
            status.output_resources.push(OutputResource::kubernetes(
                "Deployment",
                "apps/v1",
                "Deployment",
                "default",
                "thing",
            ));
            ControllerResult::Success(OperationOutput::Updated {
                properties: ctx.envelope.properties.clone(),
                status,
            })
        }
    }
}

pub struct Harness {
    pub router: Router,
    pub registry: Arc<UcpRegistry>,
    pub deps: ControllerDeps,
    pub queue: Arc<InMemoryQueue>,
    gate: Arc<Notify>,
}

impl Harness {
    /// `create_script` drives the async type's Create controller; Update and
    /// Delete controllers always succeed immediately.
    pub fn new(create_script: Vec<Step>) -> Self {
        let store = Arc::new(InMemoryStateStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let deps = ControllerDeps {
            store: store.clone(),
            secrets: Arc::new(InMemorySecretStore::new()),
            queue: queue.clone(),
            operations: OperationStatusManager::new(store),
        };

        let gate = Arc::new(Notify::new());
        let create = ScriptedController::new(create_script, Arc::clone(&gate));
        let update = ScriptedController::new(Vec::new(), Arc::clone(&gate));
        let delete = ScriptedController::new(Vec::new(), Arc::clone(&gate));

        let (router, registry) = UcpRouterBuilder::new()
            .provider(
                ResourceProviderBuilder::new("Applications.Test")
                    .resource_type(
                        ResourceType::new("syncthings").version::<ThingV20231001>(API_VERSION),
                    )
                    .resource_type(
                        ResourceType::new("asyncthings")
                            .version::<ThingV20231001>(API_VERSION)
                            .asynchronous()
                            .controller(OperationKind::Create, create)
                            .controller(OperationKind::Update, update)
                            .controller(OperationKind::Delete, delete),
                    ),
            )
            .build(deps.clone())
            .expect("test registry builds");

        Self {
            router,
            registry,
            deps,
            queue,
            gate,
        }
    }

    pub fn worker(&self, options: WorkerOptions) -> Arc<Worker> {
        Arc::new(Worker::new(
            self.deps.clone(),
            Arc::clone(&self.registry),
            options,
        ))
    }

    /// Unblocks a controller waiting on [`Step::Block`].
    pub fn release(&self) {
        self.gate.notify_one();
    }
}

pub fn sync_uri(name: &str) -> String {
    format!(
        "/planes/radius/local/resourceGroups/rg1/providers/Applications.Test/syncthings/{name}?api-version={API_VERSION}"
    )
}

pub fn async_uri(name: &str) -> String {
    format!(
        "/planes/radius/local/resourceGroups/rg1/providers/Applications.Test/asyncthings/{name}?api-version={API_VERSION}"
    )
}

pub fn thing_body() -> String {
    serde_json::json!({"properties": {"size": "small"}}).to_string()
}
