//! Versioned wire models.
//!
//! One API version is currently served: `2023-10-01-preview`. Its wire
//! properties coincide with the internal models, so the codecs are identity
//! conversions; the registry still dispatches through them, and a future
//! version only needs its own model pair here.

use radius_armrpc::convert::{ApiModel, ConversionError};

use crate::datamodel;

pub const V20231001: &str = "2023-10-01-preview";

macro_rules! identity_api_model {
    ($(#[$doc:meta])* $name:ident => $properties:ty) => {
        $(#[$doc])*
        pub struct $name;

        impl ApiModel for $name {
            type WireProperties = $properties;
            type Properties = $properties;

            fn properties_to_internal(
                wire: Self::WireProperties,
            ) -> Result<Self::Properties, ConversionError> {
                Ok(wire)
            }

            fn properties_from_internal(
                internal: &Self::Properties,
            ) -> Result<Self::WireProperties, ConversionError> {
                Ok(internal.clone())
            }
        }
    };
}

identity_api_model!(
    /// `Applications.Core/environments@2023-10-01-preview`
    EnvironmentV20231001 => datamodel::EnvironmentProperties
);
identity_api_model!(
    /// `Applications.Core/applications@2023-10-01-preview`
    ApplicationV20231001 => datamodel::ApplicationProperties
);
identity_api_model!(
    /// `Applications.Core/containers@2023-10-01-preview`
    ContainerV20231001 => datamodel::ContainerProperties
);
identity_api_model!(
    /// `Applications.Core/gateways@2023-10-01-preview`
    GatewayV20231001 => datamodel::GatewayProperties
);
identity_api_model!(
    /// `Applications.Core/httpRoutes@2023-10-01-preview`
    HttpRouteV20231001 => datamodel::HttpRouteProperties
);
identity_api_model!(
    /// `Applications.Core/volumes@2023-10-01-preview`
    VolumeV20231001 => datamodel::VolumeProperties
);
identity_api_model!(
    /// `Applications.Core/secretStores@2023-10-01-preview`
    SecretStoreV20231001 => datamodel::SecretStoreProperties
);
identity_api_model!(
    /// `Applications.Core/extenders@2023-10-01-preview`
    ExtenderV20231001 => datamodel::ExtenderProperties
);
identity_api_model!(
    /// `Applications.Datastores/redisCaches@2023-10-01-preview`
    RedisCacheV20231001 => datamodel::RedisCacheProperties
);
identity_api_model!(
    /// `Applications.Datastores/mongoDatabases@2023-10-01-preview`
    MongoDatabaseV20231001 => datamodel::MongoDatabaseProperties
);
identity_api_model!(
    /// `Applications.Datastores/sqlDatabases@2023-10-01-preview`
    SqlDatabaseV20231001 => datamodel::SqlDatabaseProperties
);
identity_api_model!(
    /// `Applications.Messaging/rabbitMQQueues@2023-10-01-preview`
    RabbitMQQueueV20231001 => datamodel::RabbitMQQueueProperties
);
identity_api_model!(
    /// `Applications.Dapr/stateStores@2023-10-01-preview`
    DaprStateStoreV20231001 => datamodel::DaprStateStoreProperties
);
identity_api_model!(
    /// `Applications.Dapr/pubSubBrokers@2023-10-01-preview`
    DaprPubSubBrokerV20231001 => datamodel::DaprPubSubBrokerProperties
);
