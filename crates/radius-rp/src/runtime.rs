//! Applying rendered workloads to the target runtime.

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Secret, Service},
    networking::v1::Ingress,
};
use kube::{
    Api, Client,
    api::{DeleteParams, Patch, PatchParams},
};
use radius_resource::OutputResource;
use serde::{Serialize, de::DeserializeOwned};
use snafu::{ResultExt, Snafu};

use crate::renderers::{KubernetesObject, RenderedWorkload};

const FIELD_MANAGER: &str = "radius-ucp";

#[derive(Debug, Snafu)]
pub enum RuntimeError {
    #[snafu(display("kubernetes request failed"))]
    Kubernetes { source: kube::Error },

    #[snafu(display("output resource {id:?} has an unsupported identity"))]
    UnsupportedIdentity { id: String },
}

impl RuntimeError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Kubernetes { source } => match source {
                kube::Error::Api(response) => {
                    response.code == 409 || response.code == 429 || response.code >= 500
                }
                kube::Error::HyperError(_) | kube::Error::Service(_) => true,
                _ => false,
            },
            Self::UnsupportedIdentity { .. } => false,
        }
    }
}

/// An object kind the runtime can render and later tear down again. The set
/// matches [`KubernetesObject`]; an identity with any other kind can only
/// appear through out-of-band edits of the resource document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DeletableKind {
    Deployment,
    Service,
    Secret,
    Ingress,
}

impl DeletableKind {
    fn parse(kind: &str) -> Option<Self> {
        match kind {
            "Deployment" => Some(Self::Deployment),
            "Service" => Some(Self::Service),
            "Secret" => Some(Self::Secret),
            "Ingress" => Some(Self::Ingress),
            _ => None,
        }
    }
}

/// Decides what teardown does with one recorded output: `Some` parses the
/// `Kind/namespace/name` identity written by [`KubernetesObject::output_resource`],
/// `None` skips it (unowned references and non-kubernetes outputs are never
/// mutated here).
fn teardown_target(
    output: &OutputResource,
) -> Result<Option<(DeletableKind, &str, &str)>, RuntimeError> {
    if !output.radius_managed {
        // Referenced but not owned: never mutated.
        return Ok(None);
    }
    if !output.identity.provider.eq_ignore_ascii_case("kubernetes") {
        tracing::warn!(
            id = %output.identity.id,
            provider = %output.identity.provider,
            "skipping non-kubernetes output on workload teardown"
        );
        return Ok(None);
    }

    let unsupported = || RuntimeError::UnsupportedIdentity {
        id: output.identity.id.clone(),
    };

    let mut parts = output.identity.id.splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(kind), Some(namespace), Some(name)) if !namespace.is_empty() && !name.is_empty() => {
            let kind = DeletableKind::parse(kind).ok_or_else(unsupported)?;
            Ok(Some((kind, namespace, name)))
        }
        _ => Err(unsupported()),
    }
}

/// The runtime a container's rendered objects are applied to. A trait so the
/// worker path can be exercised without a cluster.
#[async_trait]
pub trait WorkloadRuntime: Send + Sync {
    async fn apply(&self, workload: &RenderedWorkload) -> Result<(), RuntimeError>;

    /// Deletes previously recorded output resources. Objects that are
    /// already gone, or that the resource does not own, are skipped.
    async fn delete(&self, outputs: &[OutputResource]) -> Result<(), RuntimeError>;
}

/// A runtime that records intent in the log and applies nothing. Used when
/// the control plane runs without cluster access (local development against
/// the embedded store).
pub struct NoopWorkloadRuntime;

#[async_trait]
impl WorkloadRuntime for NoopWorkloadRuntime {
    async fn apply(&self, workload: &RenderedWorkload) -> Result<(), RuntimeError> {
        for object in &workload.objects {
            tracing::info!(
                kind = object.kind(),
                namespace = %object.namespace(),
                name = %object.name(),
                "workload runtime disabled, skipping apply"
            );
        }
        Ok(())
    }

    async fn delete(&self, outputs: &[OutputResource]) -> Result<(), RuntimeError> {
        tracing::info!(count = outputs.len(), "workload runtime disabled, skipping delete");
        Ok(())
    }
}

/// Server-side-apply based runtime against a real cluster.
pub struct KubernetesWorkloadRuntime {
    client: Client,
}

impl KubernetesWorkloadRuntime {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn apply_object<K>(&self, namespace: &str, name: &str, object: &K) -> Result<(), RuntimeError>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Serialize
            + DeserializeOwned
            + Clone
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(object),
        )
        .await
        .context(KubernetesSnafu)?;
        Ok(())
    }

    async fn delete_object<K>(&self, namespace: &str, name: &str) -> Result<(), RuntimeError>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(error) => Err(RuntimeError::Kubernetes { source: error }),
        }
    }
}

#[async_trait]
impl WorkloadRuntime for KubernetesWorkloadRuntime {
    async fn apply(&self, workload: &RenderedWorkload) -> Result<(), RuntimeError> {
        for object in &workload.objects {
            let namespace = object.namespace();
            let name = object.name();
            tracing::debug!(kind = object.kind(), %namespace, %name, "applying object");
            match object {
                KubernetesObject::Deployment(deployment) => {
                    self.apply_object(&namespace, &name, deployment).await?;
                }
                KubernetesObject::Service(service) => {
                    self.apply_object(&namespace, &name, service).await?;
                }
                KubernetesObject::Secret(secret) => {
                    self.apply_object(&namespace, &name, secret).await?;
                }
                KubernetesObject::Ingress(ingress) => {
                    self.apply_object(&namespace, &name, ingress).await?;
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, outputs: &[OutputResource]) -> Result<(), RuntimeError> {
        for output in outputs {
            let Some((kind, namespace, name)) = teardown_target(output)? else {
                continue;
            };

            tracing::debug!(?kind, namespace, name, "deleting object");
            match kind {
                DeletableKind::Deployment => {
                    self.delete_object::<Deployment>(namespace, name).await?;
                }
                DeletableKind::Service => self.delete_object::<Service>(namespace, name).await?,
                DeletableKind::Secret => self.delete_object::<Secret>(namespace, name).await?,
                DeletableKind::Ingress => self.delete_object::<Ingress>(namespace, name).await?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use rstest::rstest;

    use super::*;

    fn output(kind: &str, namespace: &str, name: &str) -> OutputResource {
        OutputResource::kubernetes(kind, "apps/v1", kind, namespace, name)
    }

    #[rstest]
    #[case("Deployment", DeletableKind::Deployment)]
    #[case("Service", DeletableKind::Service)]
    #[case("Secret", DeletableKind::Secret)]
    #[case("Ingress", DeletableKind::Ingress)]
    fn recorded_identities_parse_back(#[case] kind: &str, #[case] expected: DeletableKind) {
        let output = output(kind, "default-app", "web");
        let (parsed, namespace, name) = teardown_target(&output).unwrap().unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(namespace, "default-app");
        assert_eq!(name, "web");
    }

    #[test]
    fn rendered_objects_produce_deletable_identities() {
        // What the renderer records must stay parseable by teardown.
        let object = KubernetesObject::Deployment(k8s_openapi::api::apps::v1::Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_owned()),
                namespace: Some("default-app".to_owned()),
                ..ObjectMeta::default()
            },
            ..k8s_openapi::api::apps::v1::Deployment::default()
        });
        let recorded = object.output_resource("Deployment");
        let (kind, namespace, name) = teardown_target(&recorded).unwrap().unwrap();
        assert_eq!(kind, DeletableKind::Deployment);
        assert_eq!(namespace, "default-app");
        assert_eq!(name, "web");
    }

    #[rstest]
    #[case::missing_name("Deployment/default-app")]
    #[case::missing_namespace_and_name("Deployment")]
    #[case::empty_namespace("Deployment//web")]
    #[case::empty_name("Deployment/default-app/")]
    fn malformed_identities_are_unsupported(#[case] id: &str) {
        let mut output = output("Deployment", "ns", "web");
        output.identity.id = id.to_owned();
        let result = teardown_target(&output);
        assert!(matches!(result, Err(RuntimeError::UnsupportedIdentity { .. })));
    }

    #[test]
    fn unknown_kinds_are_unsupported() {
        let output = output("ConfigMap", "default-app", "web");
        let result = teardown_target(&output);
        assert!(matches!(result, Err(RuntimeError::UnsupportedIdentity { .. })));
        assert!(!result.unwrap_err().is_transient());
    }

    #[test]
    fn unowned_outputs_are_skipped() {
        let mut output = output("Deployment", "default-app", "web");
        output.radius_managed = false;
        assert!(teardown_target(&output).unwrap().is_none());
    }

    #[test]
    fn non_kubernetes_outputs_are_skipped() {
        let mut output = output("Deployment", "default-app", "web");
        output.identity.provider = "azure".to_owned();
        output.identity.id =
            "/planes/azure/azurecloud/resourceGroups/rg/providers/Microsoft.Cache/redis/r"
                .to_owned();
        assert!(teardown_target(&output).unwrap().is_none());
    }
}
