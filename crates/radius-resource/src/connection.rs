use serde::{Deserialize, Serialize};

/// The kind of a connection between two resources.
///
/// Well-known kinds get dedicated value mapping in the resolver; everything
/// else passes computed values through under their source names.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConnectionKind {
    #[default]
    Http,
    Azure,
    Other(String),
}

impl ConnectionKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Http => "http",
            Self::Azure => "Azure",
            Self::Other(kind) => kind,
        }
    }

    /// Network kinds may form cycles (a frontend and a backend calling each
    /// other is legal); every other kind participates in the provisioning
    /// order and must stay acyclic.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Http)
    }
}

impl From<String> for ConnectionKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "" | "http" => Self::Http,
            "Azure" => Self::Azure,
            _ => Self::Other(raw),
        }
    }
}

impl From<ConnectionKind> for String {
    fn from(kind: ConnectionKind) -> Self {
        kind.as_str().to_owned()
    }
}

/// A directed reference from a consumer resource to a source resource.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    /// Resource ID of the source, or a URL for `http` connections to
    /// addresses outside the application.
    pub source: String,
    #[serde(default, skip_serializing_if = "is_default_kind")]
    pub kind: ConnectionKind,
    /// Roles the consumer requests on the source, for kinds that support
    /// role assignment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    /// Disables environment variable injection for this connection.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_default_env_vars: bool,
}

fn is_default_kind(kind: &ConnectionKind) -> bool {
    *kind == ConnectionKind::Http
}

/// An opaque handle to secret material, resolvable against a secret store.
///
/// Only the reference is ever persisted on a resource document; the secret
/// bytes live in the secret store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Resource ID of the scope the secret is stored under.
    pub store: String,
    /// Name of the secret within the scope.
    pub key: String,
}
