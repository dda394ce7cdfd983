//! Parsing and formatting of ARM-style, plane-rooted resource IDs.
//!
//! A resource ID is a hierarchical path of the form
//! `/planes/{kind}/{name}[/resourceGroups/{rg}]/providers/{namespace}/{type}/{name}...`.
//! Type segments compare case-insensitively, names keep their case. Parsing
//! and formatting are exact inverses apart from that folding.

use std::{
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use snafu::{OptionExt, Snafu, ensure};
use strum::{Display, EnumString};

const PLANES_SEGMENT: &str = "planes";
const PROVIDERS_SEGMENT: &str = "providers";

type Result<T, E = InvalidResourceId> = std::result::Result<T, E>;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum InvalidResourceId {
    #[snafu(display("resource id must not be empty"))]
    Empty,

    #[snafu(display("resource id {id:?} must start with /planes/"))]
    NotPlaneRooted { id: String },

    #[snafu(display("resource id {id:?} contains an empty segment"))]
    EmptySegment { id: String },

    #[snafu(display("segment {segment:?} contains non-ASCII characters"))]
    NonAsciiSegment { segment: String },

    #[snafu(display("resource id {id:?} is missing the plane name"))]
    MissingPlaneName { id: String },

    #[snafu(display("scope {key:?} is missing its name"))]
    DanglingScope { key: String },

    #[snafu(display("resource id {id:?} has no provider namespace after /providers/"))]
    MissingProviderNamespace { id: String },

    #[snafu(display("resource id {id:?} declares a provider namespace but no resource type"))]
    MissingResourceType { id: String },
}

/// The set of plane kinds the control plane can route to.
///
/// IDs with other plane kinds still parse; dispatching them is the router's
/// concern and fails there with `PlaneNotFound`.
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum PlaneKind {
    Radius,
    Aws,
    Azure,
    Kubernetes,
}

/// A `{key}/{name}` pair forming one scope level, e.g. `resourceGroups/rg1`.
///
/// The plane itself is represented as a scope segment whose key is the plane
/// kind.
#[derive(Clone, Debug)]
pub struct ScopeSegment {
    pub key: String,
    pub name: String,
}

impl PartialEq for ScopeSegment {
    fn eq(&self, other: &Self) -> bool {
        self.key.eq_ignore_ascii_case(&other.key) && self.name == other.name
    }
}

impl Eq for ScopeSegment {}

/// A `{type}[/{name}]` pair. The name is absent for collection IDs, which
/// address every resource of the type within a scope.
#[derive(Clone, Debug)]
pub struct TypeSegment {
    pub name: String,
    pub instance: Option<String>,
}

impl PartialEq for TypeSegment {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name) && self.instance == other.instance
    }
}

impl Eq for TypeSegment {}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ProviderPart {
    namespace: String,
    types: Vec<TypeSegment>,
}

/// A parsed, plane-rooted resource ID.
///
/// ```
/// use radius_resource::ResourceId;
///
/// let id: ResourceId = "/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/containers/frontend"
///     .parse()
///     .unwrap();
/// assert_eq!(id.name(), Some("frontend"));
/// assert_eq!(id.qualified_type().as_deref(), Some("Applications.Core/containers"));
/// ```
#[derive(Clone, Debug, Eq)]
pub struct ResourceId {
    plane: ScopeSegment,
    scopes: Vec<ScopeSegment>,
    provider: Option<ProviderPart>,
}

impl ResourceId {
    /// Parses an ID from its string form. See the module docs for the shape.
    pub fn parse(raw: &str) -> Result<Self> {
        ensure!(!raw.is_empty(), EmptySnafu);

        let trimmed = raw.strip_suffix('/').unwrap_or(raw);
        let mut segments = trimmed.split('/');

        // A rooted path yields a leading empty segment.
        let rooted = segments.next() == Some("");
        let planes = segments.next().unwrap_or_default();
        ensure!(
            rooted && planes.eq_ignore_ascii_case(PLANES_SEGMENT),
            NotPlaneRootedSnafu { id: raw }
        );

        let segments = segments
            .map(|segment| {
                ensure!(!segment.is_empty(), EmptySegmentSnafu { id: raw });
                ensure!(segment.is_ascii(), NonAsciiSegmentSnafu { segment });
                Ok(segment)
            })
            .collect::<Result<Vec<_>>>()?;
        let mut segments = segments.into_iter();

        let plane_kind = segments.next().context(MissingPlaneNameSnafu { id: raw })?;
        let plane_name = segments.next().context(MissingPlaneNameSnafu { id: raw })?;
        let plane = ScopeSegment {
            key: plane_kind.to_owned(),
            name: plane_name.to_owned(),
        };

        let mut scopes = Vec::new();
        let mut provider = None;

        while let Some(segment) = segments.next() {
            if segment.eq_ignore_ascii_case(PROVIDERS_SEGMENT) {
                let namespace = segments
                    .next()
                    .context(MissingProviderNamespaceSnafu { id: raw })?;
                let mut types = Vec::new();
                while let Some(type_name) = segments.next() {
                    types.push(TypeSegment {
                        name: type_name.to_owned(),
                        instance: segments.next().map(ToOwned::to_owned),
                    });
                }
                ensure!(!types.is_empty(), MissingResourceTypeSnafu { id: raw });
                provider = Some(ProviderPart {
                    namespace: namespace.to_owned(),
                    types,
                });
                break;
            }

            let name = segments.next().context(DanglingScopeSnafu { key: segment })?;
            scopes.push(ScopeSegment {
                key: segment.to_owned(),
                name: name.to_owned(),
            });
        }

        Ok(Self {
            plane,
            scopes,
            provider,
        })
    }

    /// The plane kind segment as written, e.g. `radius`.
    pub fn plane_kind(&self) -> &str {
        &self.plane.key
    }

    /// The plane kind, if it is one the control plane knows how to route.
    pub fn known_plane(&self) -> Option<PlaneKind> {
        PlaneKind::from_str(&self.plane.key).ok()
    }

    /// The plane name segment, e.g. `local`.
    pub fn plane_name(&self) -> &str {
        &self.plane.name
    }

    /// Scope segments below the plane, e.g. `resourceGroups/rg1`.
    pub fn scopes(&self) -> &[ScopeSegment] {
        &self.scopes
    }

    /// The name of the resource group scope, if the ID carries one.
    pub fn resource_group(&self) -> Option<&str> {
        self.scopes
            .iter()
            .find(|scope| scope.key.eq_ignore_ascii_case("resourceGroups"))
            .map(|scope| scope.name.as_str())
    }

    /// The provider namespace, e.g. `Applications.Core`.
    pub fn provider_namespace(&self) -> Option<&str> {
        self.provider.as_ref().map(|p| p.namespace.as_str())
    }

    /// Type segments after the provider namespace.
    pub fn type_segments(&self) -> &[TypeSegment] {
        self.provider.as_ref().map_or(&[], |p| &p.types)
    }

    /// The fully qualified type, e.g. `Applications.Core/containers` or
    /// `Applications.Core/containers/secrets` for child types. `None` for
    /// scope-only IDs.
    pub fn qualified_type(&self) -> Option<String> {
        let provider = self.provider.as_ref()?;
        let mut qualified = provider.namespace.clone();
        for segment in &provider.types {
            qualified.push('/');
            qualified.push_str(&segment.name);
        }
        Some(qualified)
    }

    /// The name of the addressed resource. `None` for scope-only and
    /// collection IDs.
    pub fn name(&self) -> Option<&str> {
        self.provider
            .as_ref()
            .and_then(|p| p.types.last())
            .and_then(|t| t.instance.as_deref())
    }

    /// Whether this ID addresses a collection of resources rather than a
    /// single one (the last type segment carries no name).
    pub fn is_collection(&self) -> bool {
        self.provider
            .as_ref()
            .and_then(|p| p.types.last())
            .is_some_and(|t| t.instance.is_none())
    }

    /// Whether this ID addresses a scope (no provider part at all).
    pub fn is_scope(&self) -> bool {
        self.provider.is_none()
    }

    /// A scope-only ID addressing just the plane, e.g. `/planes/radius/local`.
    pub fn plane_scope(&self) -> Self {
        Self {
            plane: self.plane.clone(),
            scopes: Vec::new(),
            provider: None,
        }
    }

    /// The scope prefix of the ID: plane plus scope segments, without any
    /// provider part, e.g. `/planes/radius/local/resourceGroups/rg1`.
    pub fn root_scope(&self) -> String {
        let mut out = format!("/{PLANES_SEGMENT}/{}/{}", self.plane.key, self.plane.name);
        for scope in &self.scopes {
            out.push('/');
            out.push_str(&scope.key);
            out.push('/');
            out.push_str(&scope.name);
        }
        out
    }

    /// The ID one level up: child resources truncate to their parent
    /// resource, top-level resources to their scope, scoped IDs to the outer
    /// scope. The plane itself has no parent.
    pub fn parent(&self) -> Option<Self> {
        let mut parent = self.clone();
        match &mut parent.provider {
            Some(provider) if provider.types.len() > 1 => {
                provider.types.pop();
                Some(parent)
            }
            Some(_) => {
                parent.provider = None;
                Some(parent)
            }
            None if !parent.scopes.is_empty() => {
                parent.scopes.pop();
                Some(parent)
            }
            None => None,
        }
    }

    /// Appends a child `{type}/{name}` pair. Used to derive IDs for nested
    /// documents such as operation statuses.
    pub fn child(&self, type_name: &str, name: &str) -> Self {
        let mut child = self.clone();
        let segment = TypeSegment {
            name: type_name.to_owned(),
            instance: Some(name.to_owned()),
        };
        match &mut child.provider {
            Some(provider) => provider.types.push(segment),
            None => {
                child.provider = Some(ProviderPart {
                    namespace: "System.Resources".to_owned(),
                    types: vec![segment],
                });
            }
        }
        child
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root_scope())?;
        if let Some(provider) = &self.provider {
            write!(f, "/{PROVIDERS_SEGMENT}/{}", provider.namespace)?;
            for segment in &provider.types {
                write!(f, "/{}", segment.name)?;
                if let Some(instance) = &segment.instance {
                    write!(f, "/{instance}")?;
                }
            }
        }
        Ok(())
    }
}

impl FromStr for ResourceId {
    type Err = InvalidResourceId;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl PartialEq for ResourceId {
    fn eq(&self, other: &Self) -> bool {
        self.plane == other.plane
            && self.scopes == other.scopes
            && match (&self.provider, &other.provider) {
                (None, None) => true,
                (Some(a), Some(b)) => {
                    a.namespace.eq_ignore_ascii_case(&b.namespace) && a.types == b.types
                }
                _ => false,
            }
    }
}

impl Hash for ResourceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        fn folded<H: Hasher>(value: &str, state: &mut H) {
            for byte in value.bytes() {
                state.write_u8(byte.to_ascii_lowercase());
            }
            state.write_u8(0);
        }

        folded(&self.plane.key, state);
        self.plane.name.hash(state);
        for scope in &self.scopes {
            folded(&scope.key, state);
            scope.name.hash(state);
        }
        if let Some(provider) = &self.provider {
            folded(&provider.namespace, state);
            for segment in &provider.types {
                folded(&segment.name, state);
                segment.instance.hash(state);
            }
        }
    }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::container("/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/containers/frontend")]
    #[case::scope_only("/planes/radius/local/resourceGroups/rg1")]
    #[case::plane_only("/planes/radius/local")]
    #[case::collection("/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/containers")]
    #[case::child("/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/containers/frontend/secrets/tls")]
    #[case::aws("/planes/aws/aws/accounts/140313373712/regions/us-west-2/providers/AWS.Kinesis/Stream/my-stream")]
    fn roundtrip(#[case] raw: &str) {
        let id = ResourceId::parse(raw).unwrap();
        assert_eq!(id.to_string(), raw);
        assert_eq!(ResourceId::parse(&id.to_string()).unwrap(), id);
    }

    #[rstest]
    #[case::empty("")]
    #[case::unrooted("planes/radius/local")]
    #[case::wrong_root("/subscriptions/abc")]
    #[case::missing_plane_name("/planes/radius")]
    #[case::empty_segment("/planes/radius//providers/Applications.Core/containers/c")]
    #[case::dangling_scope("/planes/radius/local/resourceGroups")]
    #[case::no_namespace("/planes/radius/local/providers")]
    #[case::no_type("/planes/radius/local/providers/Applications.Core")]
    #[case::non_ascii("/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/containers/caf\u{00e9}")]
    fn rejects(#[case] raw: &str) {
        assert!(ResourceId::parse(raw).is_err());
    }

    #[test]
    fn type_case_is_folded_for_comparison() {
        let a = ResourceId::parse(
            "/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/containers/web",
        )
        .unwrap();
        let b = ResourceId::parse(
            "/planes/Radius/local/resourcegroups/rg1/providers/applications.core/CONTAINERS/web",
        )
        .unwrap();
        assert_eq!(a, b);

        // Names keep their case.
        let c = ResourceId::parse(
            "/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/containers/Web",
        )
        .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn accessors() {
        let id = ResourceId::parse(
            "/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/containers/web",
        )
        .unwrap();

        assert_eq!(id.known_plane(), Some(PlaneKind::Radius));
        assert_eq!(id.plane_name(), "local");
        assert_eq!(id.resource_group(), Some("rg1"));
        assert_eq!(id.provider_namespace(), Some("Applications.Core"));
        assert_eq!(
            id.qualified_type().as_deref(),
            Some("Applications.Core/containers")
        );
        assert_eq!(id.name(), Some("web"));
        assert_eq!(id.root_scope(), "/planes/radius/local/resourceGroups/rg1");
        assert!(!id.is_collection());
        assert!(!id.is_scope());
    }

    #[test]
    fn parent_chain() {
        let id = ResourceId::parse(
            "/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/containers/web/secrets/tls",
        )
        .unwrap();

        let parent = id.parent().unwrap();
        assert_eq!(
            parent.to_string(),
            "/planes/radius/local/resourceGroups/rg1/providers/Applications.Core/containers/web"
        );

        let scope = parent.parent().unwrap();
        assert_eq!(scope.to_string(), "/planes/radius/local/resourceGroups/rg1");

        let plane = scope.parent().unwrap();
        assert_eq!(plane.to_string(), "/planes/radius/local");
        assert_eq!(plane.parent(), None);
    }

    #[test]
    fn unknown_plane_still_parses() {
        let id = ResourceId::parse("/planes/gcp/proj/providers/GCP.Storage/buckets/b").unwrap();
        assert_eq!(id.known_plane(), None);
        assert_eq!(id.plane_kind(), "gcp");
    }

    #[test]
    fn serde_as_string() {
        let id = ResourceId::parse("/planes/radius/local/resourceGroups/rg1").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"/planes/radius/local/resourceGroups/rg1\"");
        let back: ResourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
