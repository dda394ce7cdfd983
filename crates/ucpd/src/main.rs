//! `ucpd`, the Radius Universal Control Plane daemon.
//!
//! Wires the configured storage, queue and recipe drivers into the provider
//! registry, then supervises the HTTP front-end and the worker pool until a
//! shutdown signal arrives.

use std::{path::PathBuf, sync::Arc};

use clap::{Args, Parser};
use radius_armrpc::{OperationStatusManager, UcpRouterBuilder, Worker, builder::ControllerDeps};
use radius_hosting::{AsyncValue, Host, TelemetryOptions, watch_shutdown_signals};
use radius_queue::{InMemoryQueue, KubernetesQueue, MessageQueue};
use radius_recipes::{BicepDriver, RecipeEngine, TerraformDriver};
use radius_rp::{
    KubernetesWorkloadRuntime, NoopWorkloadRuntime, ProviderServices, WorkloadRuntime,
    core_provider, dapr_provider, datastores_provider, messaging_provider,
};
use radius_store::{
    InMemorySecretStore, InMemoryStateStore, KubernetesSecretStore, KubernetesStateStore,
    SecretStore, StateStore,
};
use tokio_util::sync::CancellationToken;

mod config;
mod services;

use config::{QueueProvider, StorageProvider, UcpConfig, WorkloadRuntimeKind};
use services::{FrontendService, WorkerService};

#[derive(Debug, Parser)]
#[command(name = "ucpd", about = "Radius Universal Control Plane")]
enum Command {
    /// Run the control plane.
    Run(RunArguments),

    /// Print the default configuration as YAML.
    DefaultConfig,
}

#[derive(Debug, Args)]
struct RunArguments {
    /// Path to the YAML config file; defaults apply when omitted.
    #[arg(long, short = 'c', env = "UCPD_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(flatten)]
    telemetry: TelemetryOptions,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    match Command::parse() {
        Command::DefaultConfig => {
            print!("{}", serde_yaml::to_string(&UcpConfig::default())?);
            Ok(())
        }
        Command::Run(arguments) => {
            arguments.telemetry.init()?;
            let config = UcpConfig::load(arguments.config.as_deref())?;
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(run(config))
        }
    }
}

async fn run(config: UcpConfig) -> Result<(), Box<dyn std::error::Error>> {
    let needs_cluster = config.storage.provider == StorageProvider::Kubernetes
        || config.queue.provider == QueueProvider::Kubernetes
        || config.recipes.workload_runtime == WorkloadRuntimeKind::Kubernetes;
    let cluster_client = if needs_cluster {
        Some(kube::Client::try_default().await?)
    } else {
        None
    };
    let client = |purpose: &str| -> Result<kube::Client, Box<dyn std::error::Error>> {
        cluster_client
            .clone()
            .ok_or_else(|| format!("{purpose} requires cluster access").into())
    };

    let (store, secrets): (Arc<dyn StateStore>, Arc<dyn SecretStore>) =
        match config.storage.provider {
            StorageProvider::Embedded => (
                Arc::new(InMemoryStateStore::new()),
                Arc::new(InMemorySecretStore::new()),
            ),
            StorageProvider::Kubernetes => (
                Arc::new(KubernetesStateStore::new(
                    client("the kubernetes storage provider")?,
                    &config.storage.namespace,
                )),
                Arc::new(KubernetesSecretStore::new(
                    client("the kubernetes storage provider")?,
                    &config.storage.namespace,
                )),
            ),
        };

    let queue: Arc<dyn MessageQueue> = match config.queue.provider {
        QueueProvider::InMemory => Arc::new(InMemoryQueue::new()),
        QueueProvider::Kubernetes => Arc::new(KubernetesQueue::new(
            client("the kubernetes queue provider")?,
            &config.queue.namespace,
        )),
    };

    let runtime: Arc<dyn WorkloadRuntime> = match config.recipes.workload_runtime {
        WorkloadRuntimeKind::Kubernetes => Arc::new(KubernetesWorkloadRuntime::new(
            client("the kubernetes workload runtime")?,
        )),
        WorkloadRuntimeKind::Disabled => Arc::new(NoopWorkloadRuntime),
    };

    let engine = Arc::new(
        RecipeEngine::new(Arc::clone(&store), Arc::clone(&secrets))
            .driver(Arc::new(BicepDriver::new(url::Url::parse(
                &config.recipes.deployment_engine_url,
            )?)))
            .driver(Arc::new(TerraformDriver::new(
                config.recipes.terraform_binary.clone().into(),
                config.recipes.terraform_root.clone().into(),
                Arc::clone(&secrets),
            ))),
    );

    let services = ProviderServices {
        store: Arc::clone(&store),
        secrets: Arc::clone(&secrets),
        engine,
        runtime,
    };
    let deps = ControllerDeps {
        store: Arc::clone(&store),
        secrets,
        queue,
        operations: OperationStatusManager::new(Arc::clone(&store)),
    };

    let (router, registry) = UcpRouterBuilder::new()
        .provider(core_provider(&services))
        .provider(datastores_provider(&services))
        .provider(messaging_provider(&services))
        .provider(dapr_provider(&services))
        .build(deps.clone())?;

    let worker = Arc::new(Worker::new(deps, registry, config.worker.options()));

    let root = CancellationToken::new();
    watch_shutdown_signals(root.clone())?;

    tracing::info!(
        storage = ?config.storage.provider,
        queue = ?config.queue.provider,
        "control plane starting"
    );

    // The front-end produces its bound address after startup; the worker
    // consumes it before dequeueing anything.
    let (bound_address, frontend_address) = AsyncValue::<std::net::SocketAddr>::channel();

    Host::new(config.host.grace_period())
        .service(FrontendService {
            router,
            bind_address: format!("{}:{}", config.server.host, config.server.port),
            bound_address,
        })
        .service(WorkerService {
            worker,
            frontend_address,
        })
        .run(root)
        .await?;

    tracing::info!("control plane stopped");
    Ok(())
}
