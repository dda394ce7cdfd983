//! Connection and secret resolution.
//!
//! A consumer declares typed connections to source resources; the resolver
//! turns them into an injection plan: environment variables carrying the
//! source's computed values inline, and secret references the renderer
//! mounts through a Kubernetes secret. Sources that have not reached
//! `Succeeded` defer the consumer instead of failing it.

use std::collections::BTreeMap;

use radius_resource::{Connection, ResourceEnvelope, ResourceId, SecretReference};
use radius_store::{StateStore, StateStoreExt};
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum ResolveError {
    #[snafu(display("connection {name:?} points at {source:?}, which is not a resource id or URL"))]
    InvalidSource {
        name: String,
        #[snafu(source(false))]
        source: String,
    },

    #[snafu(display("connection {name:?} source {id} does not exist yet"))]
    SourceMissing { name: String, id: ResourceId },

    #[snafu(display("connection {name:?} source {id} is not ready"))]
    SourceNotReady { name: String, id: ResourceId },

    #[snafu(display("failed to read connection source"))]
    Store { source: radius_store::StoreError },
}

impl ResolveError {
    /// Missing or unready sources are a deferral, not a failure: the worker
    /// requeues and tries again once the source converges.
    pub fn should_defer(&self) -> bool {
        matches!(self, Self::SourceMissing { .. } | Self::SourceNotReady { .. })
    }
}

/// What the renderer must inject into the consumer's workload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InjectionPlan {
    /// Plain environment variables, name → value.
    pub values: BTreeMap<String, String>,
    /// Environment variables backed by secret references.
    pub secrets: BTreeMap<String, SecretReference>,
}

/// Resolves every connection of a consumer into one injection plan.
///
/// Environment variable naming is `<CONNECTION>_<KEY>` upper-cased, e.g. a
/// connection named `cache` exposing `host` becomes `CACHE_HOST`.
pub async fn resolve_connections(
    store: &dyn StateStore,
    connections: &BTreeMap<String, Connection>,
) -> Result<InjectionPlan, ResolveError> {
    let mut plan = InjectionPlan::default();

    for (name, connection) in connections {
        if connection.disable_default_env_vars {
            continue;
        }

        if let Some(values) = url_values(&connection.source) {
            for (key, value) in values {
                plan.values.insert(env_name(name, &key), value);
            }
            continue;
        }

        let id = connection.source.parse::<ResourceId>().map_err(|_| {
            ResolveError::InvalidSource {
                name: name.clone(),
                source: connection.source.clone(),
            }
        })?;

        let envelope = store
            .get_typed::<ResourceEnvelope<serde_json::Value>>(&id)
            .await
            .map_err(|source| ResolveError::Store { source })?
            .map(|(envelope, _)| envelope)
            .ok_or_else(|| ResolveError::SourceMissing {
                name: name.clone(),
                id: id.clone(),
            })?;

        if !matches!(
            envelope.provisioning_state,
            radius_resource::ProvisioningState::Succeeded
        ) {
            return Err(ResolveError::SourceNotReady {
                name: name.clone(),
                id,
            });
        }

        // Computed values first, then scalar properties the source declares
        // directly (manual provisioning puts host/port there).
        for (key, value) in &envelope.status.computed_values {
            if let Some(value) = scalar(value) {
                plan.values.insert(env_name(name, key), value);
            }
        }
        if let Some(properties) = envelope.properties.as_object() {
            for (key, value) in properties {
                if is_injectable_property(key) && !envelope.status.computed_values.contains_key(key)
                {
                    if let Some(value) = scalar(value) {
                        plan.values.insert(env_name(name, key), value);
                    }
                }
            }
        }

        for (key, reference) in &envelope.status.secrets {
            plan.secrets.insert(env_name(name, key), reference.clone());
        }
    }

    Ok(plan)
}

fn env_name(connection: &str, key: &str) -> String {
    format!(
        "{}_{}",
        connection.to_ascii_uppercase(),
        key.to_ascii_uppercase()
    )
}

/// Properties worth injecting when the source declares them inline.
fn is_injectable_property(key: &str) -> bool {
    matches!(
        key,
        "host" | "port" | "hostname" | "scheme" | "url" | "database" | "server" | "queue"
            | "username" | "vhost"
    )
}

fn scalar(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(value) => Some(value.clone()),
        serde_json::Value::Number(value) => Some(value.to_string()),
        serde_json::Value::Bool(value) => Some(value.to_string()),
        _ => None,
    }
}

/// `http`-kind connections may target a literal URL outside the application.
fn url_values(source: &str) -> Option<BTreeMap<String, String>> {
    let (scheme, rest) = source.split_once("://")?;
    if !matches!(scheme, "http" | "https") {
        return None;
    }
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    let (host, port) = match authority.split_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().ok()?),
        None if scheme == "https" => (authority, 443),
        None => (authority, 80),
    };

    Some(BTreeMap::from([
        ("scheme".to_owned(), scheme.to_owned()),
        ("host".to_owned(), host.to_owned()),
        ("port".to_owned(), port.to_string()),
        ("url".to_owned(), source.to_owned()),
    ]))
}

/// Rejects self-references and cycles among non-network connections.
///
/// Network (`http`) connections are allowed to form cycles; every other kind
/// requires its source to be `Succeeded` before the consumer renders, so a
/// cycle would deadlock provisioning. The check runs over the candidate plus
/// every sibling already in the application.
pub fn ensure_acyclic(
    candidate: (&ResourceId, &BTreeMap<String, Connection>),
    siblings: &[(ResourceId, BTreeMap<String, Connection>)],
) -> Result<(), Vec<ResourceId>> {
    let (candidate_id, candidate_connections) = candidate;

    let mut edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut insert = |from: &ResourceId, connections: &BTreeMap<String, Connection>| {
        let targets = connections
            .values()
            .filter(|connection| !connection.kind.is_network())
            .filter_map(|connection| connection.source.parse::<ResourceId>().ok())
            .map(|id| node(&id))
            .collect::<Vec<_>>();
        edges.insert(node(from), targets);
    };
    insert(candidate_id, candidate_connections);
    for (id, connections) in siblings {
        if id == candidate_id {
            continue;
        }
        insert(id, connections);
    }

    // Iterative DFS with a three-color marking.
    let mut state: BTreeMap<String, u8> = BTreeMap::new();
    for start in edges.keys() {
        if state.contains_key(start) {
            continue;
        }
        let mut stack = vec![(start.clone(), false)];
        let mut path: Vec<String> = Vec::new();
        while let Some((current, leaving)) = stack.pop() {
            if leaving {
                state.insert(current.clone(), 2);
                path.pop();
                continue;
            }
            match state.get(&current) {
                Some(1) => {
                    // Back edge: report the cycle as resource IDs.
                    let cycle_start = path.iter().position(|n| *n == current).unwrap_or(0);
                    let cycle = path[cycle_start..]
                        .iter()
                        .filter_map(|n| n.parse::<ResourceId>().ok())
                        .collect();
                    return Err(cycle);
                }
                Some(2) => continue,
                _ => {}
            }
            state.insert(current.clone(), 1);
            path.push(current.clone());
            stack.push((current.clone(), true));
            for next in edges.get(&current).into_iter().flatten() {
                match state.get(next) {
                    Some(2) => {}
                    _ => stack.push((next.clone(), false)),
                }
            }
        }
    }
    Ok(())
}

fn node(id: &ResourceId) -> String {
    // Fold the whole formatted ID; names are compared case-sensitively
    // elsewhere, but graph nodes only need a stable identity.
    id.to_string().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use radius_resource::ConnectionKind;

    use super::*;

    fn container(name: &str) -> ResourceId {
        format!(
            "/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/containers/{name}"
        )
        .parse()
        .unwrap()
    }

    fn connection(target: &ResourceId, kind: ConnectionKind) -> Connection {
        Connection {
            source: target.to_string(),
            kind,
            roles: Vec::new(),
            disable_default_env_vars: false,
        }
    }

    #[test]
    fn env_names_follow_connection_and_key() {
        assert_eq!(env_name("cache", "host"), "CACHE_HOST");
        assert_eq!(env_name("cache", "connectionString"), "CACHE_CONNECTIONSTRING");
    }

    #[test]
    fn url_sources_decompose() {
        let values = url_values("https://api.example.com/v1").unwrap();
        assert_eq!(values["scheme"], "https");
        assert_eq!(values["host"], "api.example.com");
        assert_eq!(values["port"], "443");

        let values = url_values("http://svc:8080").unwrap();
        assert_eq!(values["port"], "8080");

        assert!(url_values("redis://nope").is_none());
        assert!(url_values("/planes/radius/local").is_none());
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let id = container("a");
        let connections = BTreeMap::from([(
            "me".to_owned(),
            connection(&id, ConnectionKind::Other("x".into())),
        )]);
        assert!(ensure_acyclic((&id, &connections), &[]).is_err());
    }

    #[test]
    fn non_network_cycle_is_rejected() {
        let a = container("a");
        let b = container("b");
        let a_conns = BTreeMap::from([(
            "to_b".to_owned(),
            connection(&b, ConnectionKind::Other("mongo.com/MongoDB".into())),
        )]);
        let b_conns = BTreeMap::from([(
            "to_a".to_owned(),
            connection(&a, ConnectionKind::Other("mongo.com/MongoDB".into())),
        )]);

        let result = ensure_acyclic((&a, &a_conns), &[(b.clone(), b_conns)]);
        let cycle = result.unwrap_err();
        assert!(cycle.len() >= 2);
    }

    #[test]
    fn http_cycles_are_allowed() {
        let a = container("a");
        let b = container("b");
        let a_conns = BTreeMap::from([("to_b".to_owned(), connection(&b, ConnectionKind::Http))]);
        let b_conns = BTreeMap::from([("to_a".to_owned(), connection(&a, ConnectionKind::Http))]);

        assert!(ensure_acyclic((&a, &a_conns), &[(b, b_conns)]).is_ok());
    }

    #[test]
    fn chains_are_fine() {
        let a = container("a");
        let b = container("b");
        let c = container("c");
        let kind = || ConnectionKind::Other("x".into());
        let a_conns = BTreeMap::from([("b".to_owned(), connection(&b, kind()))]);
        let b_conns = BTreeMap::from([("c".to_owned(), connection(&c, kind()))]);

        assert!(ensure_acyclic((&a, &a_conns), &[(b, b_conns)]).is_ok());
    }
}
