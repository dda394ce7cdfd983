//! Declarative assembly of resource providers into a running control plane.
//!
//! A provider declares its namespace and resource types; each type declares
//! API versions, an optional validator, custom actions and the async
//! controllers backing it. [`UcpRouterBuilder::build`] folds everything into
//! the dispatch registry and the HTTP router, rejecting collisions instead
//! of letting a later registration shadow an earlier one.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use radius_queue::MessageQueue;
use radius_resource::{OperationKind, PlaneKind};
use radius_store::{SecretStore, StateStore};
use snafu::{Snafu, ensure};

use crate::{
    convert::{ApiModel, ConversionError, TypedCodec, UnsupportedApiVersionSnafu, VersionCodec},
    frontend::{CustomAction, ResourceValidator},
    operations::OperationStatusManager,
    router,
    worker::AsyncController,
};

/// Default wall-clock budget for one async operation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("provider namespace {namespace:?} is registered twice"))]
    DuplicateNamespace { namespace: String },

    #[snafu(display("resource type {qualified_type:?} is registered twice"))]
    DuplicateType { qualified_type: String },

    #[snafu(display("api version {api_version:?} is registered twice for {qualified_type}"))]
    DuplicateVersion {
        qualified_type: String,
        api_version: String,
    },

    #[snafu(display("action {action:?} is registered twice for {qualified_type}"))]
    DuplicateAction {
        qualified_type: String,
        action: String,
    },

    #[snafu(display("{kind} controller is registered twice for {qualified_type}"))]
    DuplicateController {
        qualified_type: String,
        kind: OperationKind,
    },

    #[snafu(display("resource type {qualified_type:?} declares no api versions"))]
    NoVersions { qualified_type: String },

    #[snafu(display(
        "asynchronous resource type {qualified_type:?} is missing a {kind} controller"
    ))]
    MissingController {
        qualified_type: String,
        kind: OperationKind,
    },
}

/// How a resource type completes operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// The front-end persists the terminal state directly; no worker, no
    /// operation status round-trip.
    Synchronous,
    /// Operations are queued and executed by the worker pool under this
    /// per-operation timeout.
    Asynchronous { timeout: Duration },
}

/// Declaration of one resource type within a provider.
pub struct ResourceType {
    name: String,
    versions: Vec<(String, Arc<dyn VersionCodec>)>,
    validator: Option<Arc<dyn ResourceValidator>>,
    lifecycle: Lifecycle,
    actions: Vec<(String, Arc<dyn CustomAction>)>,
    controllers: Vec<(OperationKind, Arc<dyn AsyncController>)>,
}

impl ResourceType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            versions: Vec::new(),
            validator: None,
            lifecycle: Lifecycle::Synchronous,
            actions: Vec::new(),
            controllers: Vec::new(),
        }
    }

    /// Registers an API version backed by a typed model pair.
    pub fn version<M: ApiModel>(self, api_version: &str) -> Self {
        self.version_codec(api_version, Arc::new(TypedCodec::<M>::new()))
    }

    pub fn version_codec(mut self, api_version: &str, codec: Arc<dyn VersionCodec>) -> Self {
        self.versions.push((api_version.to_owned(), codec));
        self
    }

    pub fn validator(mut self, validator: impl ResourceValidator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Marks the type asynchronous with the default operation timeout.
    pub fn asynchronous(self) -> Self {
        self.asynchronous_with_timeout(DEFAULT_OPERATION_TIMEOUT)
    }

    pub fn asynchronous_with_timeout(mut self, timeout: Duration) -> Self {
        self.lifecycle = Lifecycle::Asynchronous { timeout };
        self
    }

    /// Registers a POST custom action, e.g. `listSecrets`.
    pub fn action(mut self, name: &str, action: impl CustomAction + 'static) -> Self {
        self.actions.push((name.to_owned(), Arc::new(action)));
        self
    }

    /// Registers the async controller for one operation kind.
    pub fn controller(
        mut self,
        kind: OperationKind,
        controller: Arc<dyn AsyncController>,
    ) -> Self {
        self.controllers.push((kind, controller));
        self
    }
}

/// Declaration of a provider namespace, e.g. `Applications.Core`.
pub struct ResourceProviderBuilder {
    namespace: String,
    types: Vec<ResourceType>,
}

impl ResourceProviderBuilder {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            types: Vec::new(),
        }
    }

    pub fn resource_type(mut self, resource_type: ResourceType) -> Self {
        self.types.push(resource_type);
        self
    }
}

/// A fully validated resource type as the dispatcher sees it.
pub struct RegisteredType {
    pub qualified_type: String,
    pub versions: BTreeMap<String, Arc<dyn VersionCodec>>,
    pub validator: Option<Arc<dyn ResourceValidator>>,
    pub lifecycle: Lifecycle,
    pub actions: BTreeMap<String, Arc<dyn CustomAction>>,
    pub controllers: HashMap<OperationKind, Arc<dyn AsyncController>>,
}

impl RegisteredType {
    pub fn codec(&self, api_version: &str) -> Result<&Arc<dyn VersionCodec>, ConversionError> {
        self.versions.get(api_version).ok_or_else(|| {
            UnsupportedApiVersionSnafu {
                resource_type: self.qualified_type.clone(),
                api_version,
            }
            .build()
        })
    }

    pub fn timeout(&self) -> Duration {
        match self.lifecycle {
            Lifecycle::Synchronous => Duration::ZERO,
            Lifecycle::Asynchronous { timeout } => timeout,
        }
    }
}

/// The dispatch registry: every routable plane and resource type.
pub struct UcpRegistry {
    planes: HashSet<String>,
    types: HashMap<String, Arc<RegisteredType>>,
}

impl UcpRegistry {
    pub fn has_plane(&self, kind: &str) -> bool {
        self.planes.contains(&kind.to_ascii_lowercase())
    }

    pub fn resource_type(&self, qualified_type: &str) -> Option<&Arc<RegisteredType>> {
        self.types.get(&qualified_type.to_ascii_lowercase())
    }

    pub fn resource_types(&self) -> impl Iterator<Item = &Arc<RegisteredType>> {
        self.types.values()
    }
}

/// Shared handles every controller runs against. Threaded explicitly so
/// tests can swap in in-memory doubles.
#[derive(Clone)]
pub struct ControllerDeps {
    pub store: Arc<dyn StateStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub queue: Arc<dyn MessageQueue>,
    pub operations: OperationStatusManager,
}

/// Builder for the whole control plane surface.
pub struct UcpRouterBuilder {
    planes: Vec<PlaneKind>,
    providers: Vec<ResourceProviderBuilder>,
}

impl Default for UcpRouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UcpRouterBuilder {
    pub fn new() -> Self {
        Self {
            planes: vec![
                PlaneKind::Radius,
                PlaneKind::Aws,
                PlaneKind::Azure,
                PlaneKind::Kubernetes,
            ],
            providers: Vec::new(),
        }
    }

    /// Restricts the routable planes; the default is all known planes.
    pub fn planes(mut self, planes: Vec<PlaneKind>) -> Self {
        self.planes = planes;
        self
    }

    pub fn provider(mut self, provider: ResourceProviderBuilder) -> Self {
        self.providers.push(provider);
        self
    }

    /// Validates all registrations and produces the registry. Collisions are
    /// an error here, never a runtime surprise.
    pub fn build_registry(self) -> Result<Arc<UcpRegistry>, BuildError> {
        let mut namespaces = HashSet::new();
        let mut types = HashMap::new();

        for provider in self.providers {
            ensure!(
                namespaces.insert(provider.namespace.to_ascii_lowercase()),
                DuplicateNamespaceSnafu {
                    namespace: provider.namespace,
                }
            );

            for declared in provider.types {
                let qualified_type = format!("{}/{}", provider.namespace, declared.name);

                let mut versions = BTreeMap::new();
                for (api_version, codec) in declared.versions {
                    ensure!(
                        versions.insert(api_version.clone(), codec).is_none(),
                        DuplicateVersionSnafu {
                            qualified_type: qualified_type.clone(),
                            api_version,
                        }
                    );
                }
                ensure!(
                    !versions.is_empty(),
                    NoVersionsSnafu {
                        qualified_type: qualified_type.clone(),
                    }
                );

                let mut actions = BTreeMap::new();
                for (name, action) in declared.actions {
                    ensure!(
                        actions.insert(name.to_ascii_lowercase(), action).is_none(),
                        DuplicateActionSnafu {
                            qualified_type: qualified_type.clone(),
                            action: name,
                        }
                    );
                }

                let mut controllers = HashMap::new();
                for (kind, controller) in declared.controllers {
                    ensure!(
                        controllers.insert(kind, controller).is_none(),
                        DuplicateControllerSnafu {
                            qualified_type: qualified_type.clone(),
                            kind,
                        }
                    );
                }

                if let Lifecycle::Asynchronous { .. } = declared.lifecycle {
                    for kind in [OperationKind::Create, OperationKind::Update, OperationKind::Delete]
                    {
                        ensure!(
                            controllers.contains_key(&kind),
                            MissingControllerSnafu {
                                qualified_type: qualified_type.clone(),
                                kind,
                            }
                        );
                    }
                }

                let registered = RegisteredType {
                    qualified_type: qualified_type.clone(),
                    versions,
                    validator: declared.validator,
                    lifecycle: declared.lifecycle,
                    actions,
                    controllers,
                };
                ensure!(
                    types
                        .insert(qualified_type.to_ascii_lowercase(), Arc::new(registered))
                        .is_none(),
                    DuplicateTypeSnafu { qualified_type }
                );
            }
        }

        Ok(Arc::new(UcpRegistry {
            planes: self.planes.iter().map(|p| p.to_string()).collect(),
            types,
        }))
    }

    /// Builds the HTTP router and the registry the worker pool shares.
    pub fn build(
        self,
        deps: ControllerDeps,
    ) -> Result<(axum::Router, Arc<UcpRegistry>), BuildError> {
        let registry = self.build_registry()?;
        let router = router::ucp_router(Arc::clone(&registry), deps);
        Ok((router, registry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::InternalPayload;

    struct NoopCodec;

    impl VersionCodec for NoopCodec {
        fn to_internal(&self, _body: &[u8]) -> Result<InternalPayload, ConversionError> {
            Ok(InternalPayload {
                location: None,
                properties: serde_json::Value::Null,
            })
        }

        fn from_internal(
            &self,
            _envelope: &radius_resource::ResourceEnvelope<serde_json::Value>,
        ) -> Result<serde_json::Value, ConversionError> {
            Ok(serde_json::Value::Null)
        }
    }

    fn sync_type(name: &str) -> ResourceType {
        ResourceType::new(name).version_codec("2023-10-01-preview", Arc::new(NoopCodec))
    }

    #[test]
    fn builds_and_looks_up_case_insensitively() {
        let registry = UcpRouterBuilder::new()
            .provider(
                ResourceProviderBuilder::new("Applications.Core")
                    .resource_type(sync_type("environments"))
                    .resource_type(sync_type("applications")),
            )
            .build_registry()
            .unwrap();

        assert!(registry.has_plane("radius"));
        assert!(registry.has_plane("AWS"));
        assert!(!registry.has_plane("gcp"));
        assert!(registry.resource_type("applications.core/ENVIRONMENTS").is_some());
        assert!(registry.resource_type("Applications.Core/unknown").is_none());
    }

    #[test]
    fn duplicate_type_is_a_build_failure() {
        let result = UcpRouterBuilder::new()
            .provider(
                ResourceProviderBuilder::new("Applications.Core")
                    .resource_type(sync_type("environments"))
                    .resource_type(sync_type("Environments")),
            )
            .build_registry();
        assert!(matches!(result, Err(BuildError::DuplicateType { .. })));
    }

    #[test]
    fn duplicate_version_is_a_build_failure() {
        let result = UcpRouterBuilder::new()
            .provider(ResourceProviderBuilder::new("Applications.Core").resource_type(
                sync_type("environments").version_codec("2023-10-01-preview", Arc::new(NoopCodec)),
            ))
            .build_registry();
        assert!(matches!(result, Err(BuildError::DuplicateVersion { .. })));
    }

    #[test]
    fn type_without_versions_is_rejected() {
        let result = UcpRouterBuilder::new()
            .provider(
                ResourceProviderBuilder::new("Applications.Core")
                    .resource_type(ResourceType::new("environments")),
            )
            .build_registry();
        assert!(matches!(result, Err(BuildError::NoVersions { .. })));
    }

    #[test]
    fn async_type_requires_all_controllers() {
        let result = UcpRouterBuilder::new()
            .provider(
                ResourceProviderBuilder::new("Applications.Core")
                    .resource_type(sync_type("containers").asynchronous()),
            )
            .build_registry();
        assert!(matches!(result, Err(BuildError::MissingController { .. })));
    }

    #[test]
    fn unsupported_version_lookup() {
        let registry = UcpRouterBuilder::new()
            .provider(
                ResourceProviderBuilder::new("Applications.Core")
                    .resource_type(sync_type("environments")),
            )
            .build_registry()
            .unwrap();
        let registered = registry
            .resource_type("Applications.Core/environments")
            .unwrap();
        assert!(registered.codec("2023-10-01-preview").is_ok());
        assert!(matches!(
            registered.codec("9999-99-99"),
            Err(ConversionError::UnsupportedApiVersion { .. })
        ));
    }
}
