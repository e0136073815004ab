//! Resource identity and the rendered resource record consumed from the render step.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Group/version/kind plus namespace and name of a cluster object.
///
/// Cluster-scoped objects carry an empty namespace; core-group kinds an empty group.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceIdentity {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(group: &str, version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Parse `apiVersion` (`v1` or `group/v1`) into group and version.
    pub fn from_api_version(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        Self::new(group, version, kind, namespace, name)
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// Same object on the API server: group, kind, namespace and name match.
    /// Objects keep their identity across API version changes.
    pub fn same_object(&self, other: &ResourceIdentity) -> bool {
        self.group == other.group && self.kind == other.kind && self.namespace == other.namespace && self.name == other.name
    }

    /// Exact group/version/kind/namespace/name equality.
    pub fn same_gvk_object(&self, other: &ResourceIdentity) -> bool {
        self.version == other.version && self.same_object(other)
    }

    pub fn is_namespace(&self) -> bool {
        self.group.is_empty() && self.kind == "Namespace"
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gk = if self.group.is_empty() { self.kind.clone() } else { format!("{}.{}", self.kind, self.group) };
        if self.namespace.is_empty() {
            write!(f, "{}/{}", gk, self.name)
        } else {
            write!(f, "{}/{}/{}", gk, self.namespace, self.name)
        }
    }
}

/// One concrete manifest produced by the render step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderedResource {
    pub identity: ResourceIdentity,
    /// Logical grouping assigned by the renderer.
    #[serde(default)]
    pub component: String,
    /// Ordering hint only; lower applies first.
    #[serde(default)]
    pub weight: i32,
    pub content: serde_json::Value,
}

impl RenderedResource {
    /// Apply order key: `(weight, group, kind, namespace, name)`.
    pub fn sort_key(&self) -> (i32, &str, &str, &str, &str) {
        (
            self.weight,
            self.identity.group.as_str(),
            self.identity.kind.as_str(),
            self.identity.namespace.as_str(),
            self.identity.name.as_str(),
        )
    }
}
