//! Assembly of the built-in providers against the armrpc builder.

use std::sync::Arc;

use radius_armrpc::{ResourceProviderBuilder, ResourceType};
use radius_recipes::RecipeEngine;
use radius_resource::OperationKind;
use radius_store::{SecretStore, StateStore};

use crate::{
    api,
    controllers::{
        ContainerController, GatewayController, ListSecretsAction, RecipeResourceController,
        SecretStoreController,
    },
    runtime::WorkloadRuntime,
    validators::{
        ApplicationValidator, ContainerValidator, EnvironmentValidator, PortableResourceValidator,
    },
};

/// Shared handles the providers close over at assembly time.
#[derive(Clone)]
pub struct ProviderServices {
    pub store: Arc<dyn StateStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub engine: Arc<RecipeEngine>,
    pub runtime: Arc<dyn WorkloadRuntime>,
}

fn with_controllers(
    resource_type: ResourceType,
    controller: Arc<dyn radius_armrpc::AsyncController>,
) -> ResourceType {
    resource_type
        .controller(OperationKind::Create, Arc::clone(&controller))
        .controller(OperationKind::Update, Arc::clone(&controller))
        .controller(OperationKind::Delete, controller)
}

fn recipe_backed<M: radius_armrpc::convert::ApiModel>(
    name: &str,
    services: &ProviderServices,
) -> ResourceType {
    with_controllers(
        ResourceType::new(name)
            .version::<M>(api::V20231001)
            .validator(PortableResourceValidator)
            .asynchronous(),
        Arc::new(RecipeResourceController::new(Arc::clone(&services.engine))),
    )
}

/// `Applications.Core`: the application graph.
pub fn core_provider(services: &ProviderServices) -> ResourceProviderBuilder {
    let container = Arc::new(ContainerController::new(
        Arc::clone(&services.store),
        Arc::clone(&services.secrets),
        Arc::clone(&services.runtime),
    ));
    let gateway = Arc::new(GatewayController::new(
        Arc::clone(&services.store),
        Arc::clone(&services.runtime),
    ));
    let secret_store = Arc::new(SecretStoreController::new(Arc::clone(&services.secrets)));

    ResourceProviderBuilder::new("Applications.Core")
        .resource_type(
            ResourceType::new("environments")
                .version::<api::EnvironmentV20231001>(api::V20231001)
                .validator(EnvironmentValidator),
        )
        .resource_type(
            ResourceType::new("applications")
                .version::<api::ApplicationV20231001>(api::V20231001)
                .validator(ApplicationValidator),
        )
        .resource_type(with_controllers(
            ResourceType::new("containers")
                .version::<api::ContainerV20231001>(api::V20231001)
                .validator(ContainerValidator)
                .asynchronous(),
            container,
        ))
        .resource_type(with_controllers(
            ResourceType::new("gateways")
                .version::<api::GatewayV20231001>(api::V20231001)
                .asynchronous(),
            gateway,
        ))
        .resource_type(
            ResourceType::new("httpRoutes").version::<api::HttpRouteV20231001>(api::V20231001),
        )
        .resource_type(
            ResourceType::new("volumes").version::<api::VolumeV20231001>(api::V20231001),
        )
        .resource_type(
            with_controllers(
                ResourceType::new("secretStores")
                    .version::<api::SecretStoreV20231001>(api::V20231001)
                    .asynchronous(),
                secret_store,
            )
            .action("listSecrets", ListSecretsAction),
        )
        .resource_type(recipe_backed::<api::ExtenderV20231001>("extenders", services))
}

/// `Applications.Datastores`: recipe-backed data stores.
pub fn datastores_provider(services: &ProviderServices) -> ResourceProviderBuilder {
    ResourceProviderBuilder::new("Applications.Datastores")
        .resource_type(recipe_backed::<api::RedisCacheV20231001>(
            "redisCaches",
            services,
        ))
        .resource_type(recipe_backed::<api::MongoDatabaseV20231001>(
            "mongoDatabases",
            services,
        ))
        .resource_type(recipe_backed::<api::SqlDatabaseV20231001>(
            "sqlDatabases",
            services,
        ))
}

/// `Applications.Messaging`: recipe-backed message brokers.
pub fn messaging_provider(services: &ProviderServices) -> ResourceProviderBuilder {
    ResourceProviderBuilder::new("Applications.Messaging").resource_type(recipe_backed::<
        api::RabbitMQQueueV20231001,
    >(
        "rabbitMQQueues", services
    ))
}

/// `Applications.Dapr`: recipe-backed Dapr building blocks.
pub fn dapr_provider(services: &ProviderServices) -> ResourceProviderBuilder {
    ResourceProviderBuilder::new("Applications.Dapr")
        .resource_type(recipe_backed::<api::DaprStateStoreV20231001>(
            "stateStores",
            services,
        ))
        .resource_type(recipe_backed::<api::DaprPubSubBrokerV20231001>(
            "pubSubBrokers",
            services,
        ))
}
