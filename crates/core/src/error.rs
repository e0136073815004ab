//! Release engine error taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::ResourceIdentity;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A single resource that failed an apply or delete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceFailure {
    pub identity: ResourceIdentity,
    pub message: String,
}

impl fmt::Display for ResourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.identity, self.message)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ViolationKind {
    /// The live object has a deletion timestamp.
    Terminating,
    /// The live object is labelled as belonging to another release.
    OwnedByOtherRelease,
}

/// Reason a pre-apply check refused to touch a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreApplyViolation {
    pub identity: ResourceIdentity,
    pub kind: ViolationKind,
    /// `namespace/name` of the owning release when `kind` is `OwnedByOtherRelease`.
    pub owner: Option<String>,
}

impl fmt::Display for PreApplyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ViolationKind::Terminating => write!(f, "{} is terminating", self.identity),
            ViolationKind::OwnedByOtherRelease => write!(
                f,
                "{} is owned by release {}",
                self.identity,
                self.owner.as_deref().unwrap_or("<unknown>")
            ),
        }
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("render of module {module} failed: {source}")]
    Render {
        module: String,
        #[source]
        source: BoxError,
    },
    #[error(
        "render of release {namespace}/{name} produced no resources while {previous} are tracked; refusing to prune the whole release without the allow-empty override"
    )]
    EmptyRender { name: String, namespace: String, previous: usize },
    #[error("pre-apply check failed: {}", join(.violations))]
    PreApplyConflict { violations: Vec<PreApplyViolation> },
    #[error("apply failed after {applied}/{total} resources: {failure}")]
    Apply { applied: usize, total: usize, failure: ResourceFailure },
    #[error("prune failed for {} resource(s): {}", .failures.len(), join(.failures))]
    Prune { change_id: String, failures: Vec<ResourceFailure> },
    #[error("inventory for release {namespace}/{name} was modified concurrently; re-run to reconcile against the latest state")]
    InventoryConflict { name: String, namespace: String },
    #[error("release {namespace}/{name} not found")]
    ReleaseNotFound { name: String, namespace: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error("inventory access failed: {0}")]
    Inventory(#[source] BoxError),
    #[error("cluster lookup failed: {0}")]
    Cluster(#[source] BoxError),
}

impl ReleaseError {
    /// Stable process exit code per error category.
    pub fn exit_code(&self) -> i32 {
        match self {
            ReleaseError::Render { .. } => 10,
            ReleaseError::EmptyRender { .. } => 11,
            ReleaseError::PreApplyConflict { .. } => 12,
            ReleaseError::Apply { .. } => 13,
            ReleaseError::Prune { .. } => 14,
            ReleaseError::InventoryConflict { .. } => 15,
            ReleaseError::ReleaseNotFound { .. } => 16,
            ReleaseError::Cancelled => 130,
            ReleaseError::Inventory(_) | ReleaseError::Cluster(_) => 1,
        }
    }

    pub fn render(module: &str, err: anyhow::Error) -> Self {
        ReleaseError::Render { module: module.to_string(), source: err.into() }
    }

    pub fn cluster(err: anyhow::Error) -> Self {
        ReleaseError::Cluster(err.into())
    }
}
