//! Collaborator seams: the render step and the cluster API.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::identity::{RenderedResource, ResourceIdentity};
use crate::inventory::ModuleRef;

/// Turns a module plus user values into concrete manifests.
#[async_trait::async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, module: &ModuleRef, values: &serde_json::Value) -> Result<Vec<RenderedResource>>;
}

/// Live object as observed through a targeted GET.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiveResource {
    pub identity: ResourceIdentity,
    pub labels: BTreeMap<String, String>,
    /// Deletion timestamp is set.
    pub terminating: bool,
    pub content: serde_json::Value,
}

impl LiveResource {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(|s| s.as_str())
    }
}

/// Targeted cluster operations. Implementations must treat not-found on delete as success.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<LiveResource>>;
    async fn apply(&self, resource: &RenderedResource) -> Result<()>;
    async fn delete(&self, identity: &ResourceIdentity) -> Result<()>;
}
