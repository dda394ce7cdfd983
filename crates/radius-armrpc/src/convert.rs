//! Conversion between versioned wire models and the internal data model.
//!
//! Every resource type registers one [`VersionCodec`] per supported API
//! version. The framework only ever sees internal documents; controllers
//! never branch on API versions. [`TypedCodec`] adapts a pair of typed
//! models to the object-safe codec the registry stores.

use std::marker::PhantomData;

use radius_resource::ResourceEnvelope;
use serde::{Serialize, de::DeserializeOwned};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConversionError {
    #[snafu(display("request body is not valid JSON for this api version"))]
    InvalidPayload { source: serde_json::Error },

    #[snafu(display("api version {api_version:?} is not supported for {resource_type}"))]
    UnsupportedApiVersion {
        resource_type: String,
        api_version: String,
    },

    #[snafu(display("internal document cannot be rendered for this api version"))]
    RenderDocument { source: serde_json::Error },
}

/// What a versioned PUT body converts into: the type-specific internal
/// properties plus the envelope fields a client may set.
#[derive(Clone, Debug, PartialEq)]
pub struct InternalPayload {
    pub location: Option<String>,
    pub properties: serde_json::Value,
}

/// Bidirectional conversion for one (resource type, API version) pair.
pub trait VersionCodec: Send + Sync {
    /// Decodes and converts a wire body into the internal model. Fails with
    /// [`ConversionError::InvalidPayload`] on malformed bodies.
    fn to_internal(&self, body: &[u8]) -> Result<InternalPayload, ConversionError>;

    /// Renders an internal document as the wire shape of this version.
    fn from_internal(
        &self,
        envelope: &ResourceEnvelope<serde_json::Value>,
    ) -> Result<serde_json::Value, ConversionError>;
}

/// A versioned API model: the wire-facing struct for one API version of one
/// resource type.
///
/// `Properties` is the internal properties model shared by all versions of
/// the type. The default `render_properties` round-trips the internal
/// properties through the version's wire properties type, which drops fields
/// the version does not know and injects the version's defaults.
pub trait ApiModel: Send + Sync + 'static {
    /// Wire properties for this version.
    type WireProperties: Serialize + DeserializeOwned + Send;
    /// Internal properties model.
    type Properties: Serialize + DeserializeOwned;

    fn properties_to_internal(wire: Self::WireProperties)
    -> Result<Self::Properties, ConversionError>;

    fn properties_from_internal(
        internal: &Self::Properties,
    ) -> Result<Self::WireProperties, ConversionError>;
}

/// Wire envelope common to every versioned resource body.
#[derive(serde::Deserialize)]
struct WireBody<P> {
    #[serde(default)]
    location: Option<String>,
    properties: P,
}

/// Adapts an [`ApiModel`] to the object-safe [`VersionCodec`].
pub struct TypedCodec<M> {
    _model: PhantomData<fn() -> M>,
}

impl<M> TypedCodec<M> {
    pub fn new() -> Self {
        Self {
            _model: PhantomData,
        }
    }
}

impl<M> Default for TypedCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: ApiModel> VersionCodec for TypedCodec<M> {
    fn to_internal(&self, body: &[u8]) -> Result<InternalPayload, ConversionError> {
        let wire: WireBody<M::WireProperties> =
            serde_json::from_slice(body).context(InvalidPayloadSnafu)?;
        let internal = M::properties_to_internal(wire.properties)?;
        let properties = serde_json::to_value(&internal).context(InvalidPayloadSnafu)?;
        Ok(InternalPayload {
            location: wire.location,
            properties,
        })
    }

    fn from_internal(
        &self,
        envelope: &ResourceEnvelope<serde_json::Value>,
    ) -> Result<serde_json::Value, ConversionError> {
        let internal: M::Properties =
            serde_json::from_value(envelope.properties.clone()).context(RenderDocumentSnafu)?;
        let wire = M::properties_from_internal(&internal)?;
        let mut properties = serde_json::to_value(&wire).context(RenderDocumentSnafu)?;

        // Server-stamped fields clients read from properties.
        if let Some(map) = properties.as_object_mut() {
            map.insert(
                "provisioningState".to_owned(),
                serde_json::to_value(envelope.provisioning_state).context(RenderDocumentSnafu)?,
            );
            if !envelope.status.output_resources.is_empty()
                || !envelope.status.computed_values.is_empty()
            {
                map.insert(
                    "status".to_owned(),
                    serde_json::to_value(&envelope.status).context(RenderDocumentSnafu)?,
                );
            }
        }

        Ok(serde_json::json!({
            "id": envelope.id,
            "name": envelope.name,
            "type": envelope.resource_type,
            "location": envelope.location,
            "systemData": envelope.system_data,
            "properties": properties,
        }))
    }
}

#[cfg(test)]
mod tests {
    use radius_resource::{InternalMetadata, ProvisioningState, ResourceStatus, SystemData};
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Serialize, Deserialize)]
    struct WireProps {
        host: String,
        #[serde(default = "default_port")]
        port: u16,
    }

    fn default_port() -> u16 {
        6379
    }

    #[derive(Serialize, Deserialize)]
    struct InternalProps {
        host: String,
        port: u16,
    }

    struct V1;

    impl ApiModel for V1 {
        type WireProperties = WireProps;
        type Properties = InternalProps;

        fn properties_to_internal(wire: WireProps) -> Result<InternalProps, ConversionError> {
            Ok(InternalProps {
                host: wire.host,
                port: wire.port,
            })
        }

        fn properties_from_internal(
            internal: &InternalProps,
        ) -> Result<WireProps, ConversionError> {
            Ok(WireProps {
                host: internal.host.clone(),
                port: internal.port,
            })
        }
    }

    fn envelope(properties: serde_json::Value) -> ResourceEnvelope<serde_json::Value> {
        ResourceEnvelope {
            id: "/planes/radius/local/resourceGroups/rg1/providers/Applications.Datastores/redisCaches/cache"
                .parse()
                .unwrap(),
            name: "cache".into(),
            resource_type: "Applications.Datastores/redisCaches".into(),
            location: "global".into(),
            provisioning_state: ProvisioningState::Succeeded,
            system_data: SystemData::default(),
            internal_metadata: InternalMetadata::default(),
            status: ResourceStatus::default(),
            properties,
        }
    }

    #[test]
    fn to_internal_applies_version_defaults() {
        let codec = TypedCodec::<V1>::new();
        let payload = codec
            .to_internal(br#"{"properties": {"host": "redis.internal"}}"#)
            .unwrap();
        assert_eq!(
            payload.properties,
            json!({"host": "redis.internal", "port": 6379})
        );
        assert_eq!(payload.location, None);
    }

    #[test]
    fn malformed_body_is_invalid_payload() {
        let codec = TypedCodec::<V1>::new();
        let result = codec.to_internal(br"{not json");
        assert!(matches!(result, Err(ConversionError::InvalidPayload { .. })));
        // Well-formed JSON missing required fields is also a payload error.
        let result = codec.to_internal(br#"{"properties": {}}"#);
        assert!(matches!(result, Err(ConversionError::InvalidPayload { .. })));
    }

    #[test]
    fn roundtrip_modulo_default_injection() {
        let codec = TypedCodec::<V1>::new();
        let payload = codec
            .to_internal(br#"{"properties": {"host": "h", "port": 1234}}"#)
            .unwrap();

        let rendered = codec.from_internal(&envelope(payload.properties)).unwrap();
        assert_eq!(rendered["properties"]["host"], "h");
        assert_eq!(rendered["properties"]["port"], 1234);
        assert_eq!(rendered["properties"]["provisioningState"], "Succeeded");
        assert_eq!(rendered["type"], "Applications.Datastores/redisCaches");
    }
}
