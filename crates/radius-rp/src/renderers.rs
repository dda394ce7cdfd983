//! Rendering of application resources into Kubernetes objects.

use std::collections::BTreeMap;

use k8s_openapi::{
    ByteString,
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Container, ContainerPort, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, Secret,
            SecretKeySelector, Service, ServicePort, ServiceSpec,
        },
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, ServiceBackendPort,
        },
    },
    apimachinery::pkg::{apis::meta::v1::LabelSelector, apis::meta::v1::ObjectMeta},
};
use radius_resource::OutputResource;

use crate::{
    connections::InjectionPlan,
    datamodel::{ContainerProperties, GatewayProperties},
};

/// A rendered Kubernetes object, paired with enough identity to report it as
/// an output resource and to delete it later.
#[derive(Clone, Debug)]
pub enum KubernetesObject {
    Deployment(Deployment),
    Service(Service),
    Secret(Secret),
    Ingress(Ingress),
}

impl KubernetesObject {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Deployment(_) => "Deployment",
            Self::Service(_) => "Service",
            Self::Secret(_) => "Secret",
            Self::Ingress(_) => "Ingress",
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            Self::Deployment(_) => "apps/v1",
            Self::Service(_) | Self::Secret(_) => "v1",
            Self::Ingress(_) => "networking.k8s.io/v1",
        }
    }

    fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Deployment(object) => &object.metadata,
            Self::Service(object) => &object.metadata,
            Self::Secret(object) => &object.metadata,
            Self::Ingress(object) => &object.metadata,
        }
    }

    pub fn name(&self) -> String {
        self.metadata().name.clone().unwrap_or_default()
    }

    pub fn namespace(&self) -> String {
        self.metadata().namespace.clone().unwrap_or_default()
    }

    /// Identity recorded on the resource document, `Kind/namespace/name`.
    pub fn output_resource(&self, local_id: &str) -> OutputResource {
        OutputResource::kubernetes(
            local_id,
            self.api_version(),
            self.kind(),
            &self.namespace(),
            &self.name(),
        )
    }
}

/// A full workload rendering: the objects plus their output-resource record.
#[derive(Clone, Debug, Default)]
pub struct RenderedWorkload {
    pub objects: Vec<KubernetesObject>,
}

impl RenderedWorkload {
    pub fn output_resources(&self) -> Vec<OutputResource> {
        self.objects
            .iter()
            .map(|object| object.output_resource(object.kind()))
            .collect()
    }
}

fn labels(resource_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_owned(), resource_name.to_owned()),
        ("app.kubernetes.io/managed-by".to_owned(), "radius".to_owned()),
    ])
}

fn metadata(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_owned()),
        namespace: Some(namespace.to_owned()),
        labels: Some(labels(name)),
        ..ObjectMeta::default()
    }
}

/// Renders a container resource into a Deployment, an optional Service for
/// its declared ports, and an optional Secret carrying connection secrets.
///
/// Connection values are injected as plain environment variables; connection
/// secrets go through the rendered Secret and `secretKeyRef` entries, so the
/// material never appears in the Deployment spec.
pub fn render_container(
    name: &str,
    namespace: &str,
    properties: &ContainerProperties,
    plan: &InjectionPlan,
    secret_material: &BTreeMap<String, Vec<u8>>,
) -> RenderedWorkload {
    let secret_name = format!("{name}-connections");
    let mut env: Vec<EnvVar> = Vec::new();

    for (key, value) in &properties.container.env {
        env.push(EnvVar {
            name: key.clone(),
            value: Some(value.clone()),
            ..EnvVar::default()
        });
    }
    for (key, value) in &plan.values {
        env.push(EnvVar {
            name: key.clone(),
            value: Some(value.clone()),
            ..EnvVar::default()
        });
    }
    for key in plan.secrets.keys() {
        env.push(EnvVar {
            name: key.clone(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret_name.clone(),
                    key: key.clone(),
                    ..SecretKeySelector::default()
                }),
                ..EnvVarSource::default()
            }),
            ..EnvVar::default()
        });
    }

    let ports: Vec<ContainerPort> = properties
        .container
        .ports
        .values()
        .map(|port| ContainerPort {
            container_port: port.container_port,
            protocol: port.protocol.clone(),
            ..ContainerPort::default()
        })
        .collect();

    let deployment = Deployment {
        metadata: metadata(name, namespace),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels(name)),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(name)),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.to_owned(),
                        image: Some(properties.container.image.clone()),
                        env: (!env.is_empty()).then_some(env),
                        ports: (!ports.is_empty()).then_some(ports),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    };

    let mut objects = vec![KubernetesObject::Deployment(deployment)];

    if !properties.container.ports.is_empty() {
        let service = Service {
            metadata: metadata(name, namespace),
            spec: Some(ServiceSpec {
                selector: Some(labels(name)),
                ports: Some(
                    properties
                        .container
                        .ports
                        .iter()
                        .map(|(port_name, port)| ServicePort {
                            name: Some(port_name.clone()),
                            port: port.container_port,
                            protocol: port.protocol.clone(),
                            ..ServicePort::default()
                        })
                        .collect(),
                ),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        };
        objects.push(KubernetesObject::Service(service));
    }

    if !secret_material.is_empty() {
        let secret = Secret {
            metadata: metadata(&secret_name, namespace),
            data: Some(
                secret_material
                    .iter()
                    .map(|(key, value)| (key.clone(), ByteString(value.clone())))
                    .collect(),
            ),
            ..Secret::default()
        };
        objects.push(KubernetesObject::Secret(secret));
    }

    RenderedWorkload { objects }
}

/// Renders a gateway into an Ingress with one path rule per route.
pub fn render_gateway(
    name: &str,
    namespace: &str,
    properties: &GatewayProperties,
) -> RenderedWorkload {
    let paths: Vec<HTTPIngressPath> = properties
        .routes
        .iter()
        .map(|route| {
            let (service, port) = destination_backend(&route.destination);
            HTTPIngressPath {
                path: Some(route.path.clone()),
                path_type: "Prefix".to_owned(),
                backend: IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: service,
                        port: Some(ServiceBackendPort {
                            number: Some(port),
                            ..ServiceBackendPort::default()
                        }),
                    }),
                    ..IngressBackend::default()
                },
            }
        })
        .collect();

    let ingress = Ingress {
        metadata: metadata(name, namespace),
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: properties.hostname.clone(),
                http: Some(HTTPIngressRuleValue { paths }),
            }]),
            ..IngressSpec::default()
        }),
        ..Ingress::default()
    };

    RenderedWorkload {
        objects: vec![KubernetesObject::Ingress(ingress)],
    }
}

/// `http://service:port` or a route/container resource ID; either way the
/// backend is a service named after the target with its port.
fn destination_backend(destination: &str) -> (String, i32) {
    if let Some(rest) = destination
        .strip_prefix("http://")
        .or_else(|| destination.strip_prefix("https://"))
    {
        let authority = rest.split('/').next().unwrap_or(rest);
        match authority.split_once(':') {
            Some((host, port)) => (host.to_owned(), port.parse().unwrap_or(80)),
            None => (authority.to_owned(), 80),
        }
    } else {
        let name = destination.rsplit('/').next().unwrap_or(destination);
        (name.to_owned(), 80)
    }
}

#[cfg(test)]
mod tests {
    use radius_resource::{Connection, SecretReference};

    use super::*;
    use crate::datamodel::{ContainerPortSpec, ContainerSpec, GatewayRoute};

    fn properties() -> ContainerProperties {
        ContainerProperties {
            application:
                "/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/applications/app"
                    .parse()
                    .unwrap(),
            container: ContainerSpec {
                image: "ghcr.io/example/web:1.0".into(),
                env: BTreeMap::from([("LOG_LEVEL".to_owned(), "info".to_owned())]),
                ports: BTreeMap::from([(
                    "web".to_owned(),
                    ContainerPortSpec {
                        container_port: 8080,
                        protocol: None,
                    },
                )]),
            },
            connections: BTreeMap::from([(
                "cache".to_owned(),
                Connection {
                    source: "redis".into(),
                    ..Connection::default()
                },
            )]),
        }
    }

    #[test]
    fn renders_deployment_service_and_secret() {
        let plan = InjectionPlan {
            values: BTreeMap::from([
                ("CACHE_HOST".to_owned(), "redis.default.svc".to_owned()),
                ("CACHE_PORT".to_owned(), "6379".to_owned()),
            ]),
            secrets: BTreeMap::from([(
                "CACHE_CONNECTIONSTRING".to_owned(),
                SecretReference {
                    store: "/planes/radius/local/resourceGroups/rg1/providers/Applications.Datastores/redisCaches/redis".into(),
                    key: "connectionString".into(),
                },
            )]),
        };
        let material = BTreeMap::from([(
            "CACHE_CONNECTIONSTRING".to_owned(),
            b"redis://u:p@redis:6379".to_vec(),
        )]);

        let rendered = render_container("web", "default-app", &properties(), &plan, &material);
        assert_eq!(rendered.objects.len(), 3);

        let KubernetesObject::Deployment(deployment) = &rendered.objects[0] else {
            panic!("first object must be the deployment");
        };
        let container = &deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
        let env = container.env.as_ref().unwrap();

        let find = |name: &str| env.iter().find(|var| var.name == name).unwrap();
        assert_eq!(find("CACHE_HOST").value.as_deref(), Some("redis.default.svc"));
        assert_eq!(find("CACHE_PORT").value.as_deref(), Some("6379"));
        // The secret value rides through a secretKeyRef, never inline.
        let secret_var = find("CACHE_CONNECTIONSTRING");
        assert!(secret_var.value.is_none());
        assert_eq!(
            secret_var
                .value_from
                .as_ref()
                .unwrap()
                .secret_key_ref
                .as_ref()
                .unwrap()
                .name,
            "web-connections"
        );

        // Output resources mirror the objects.
        let outputs = rendered.output_resources();
        let kinds: Vec<_> = outputs.iter().map(|o| o.local_id.as_str()).collect();
        assert_eq!(kinds, ["Deployment", "Service", "Secret"]);
        assert!(outputs.iter().all(|o| o.radius_managed));
        assert_eq!(outputs[0].identity.id, "Deployment/default-app/web");
    }

    #[test]
    fn no_ports_no_service() {
        let mut properties = properties();
        properties.container.ports.clear();
        let rendered = render_container(
            "web",
            "ns",
            &properties,
            &InjectionPlan::default(),
            &BTreeMap::new(),
        );
        assert_eq!(rendered.objects.len(), 1);
    }

    #[test]
    fn gateway_renders_ingress_paths() {
        let rendered = render_gateway(
            "gw",
            "ns",
            &GatewayProperties {
                application:
                    "/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/applications/app"
                        .parse()
                        .unwrap(),
                hostname: Some("shop.example.com".into()),
                routes: vec![
                    GatewayRoute {
                        path: "/api".into(),
                        destination: "http://backend:8080".into(),
                    },
                    GatewayRoute {
                        path: "/".into(),
                        destination:
                            "/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/containers/frontend"
                                .into(),
                    },
                ],
            },
        );

        let KubernetesObject::Ingress(ingress) = &rendered.objects[0] else {
            panic!("expected an ingress");
        };
        let rules = ingress.spec.as_ref().unwrap().rules.as_ref().unwrap();
        assert_eq!(rules[0].host.as_deref(), Some("shop.example.com"));
        let paths = &rules[0].http.as_ref().unwrap().paths;
        assert_eq!(paths.len(), 2);
        assert_eq!(
            paths[0].backend.service.as_ref().unwrap().name,
            "backend"
        );
        assert_eq!(
            paths[1].backend.service.as_ref().unwrap().name,
            "frontend"
        );
    }
}
