//! The persisted record of what a release owns, plus its change history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::change::{prune_history, update_index};
use crate::identity::{RenderedResource, ResourceIdentity};

/// Source module reference: local path or registry URL, plus version when published.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleRef {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Provenance of one change.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSource {
    pub release_name: String,
    pub release_namespace: String,
    pub module: ModuleRef,
    pub values_digest: String,
}

/// One tracked resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InventoryEntry {
    #[serde(flatten)]
    pub identity: ResourceIdentity,
    #[serde(default)]
    pub component: String,
    /// Apply-order weight, kept so teardown can run in reverse order.
    #[serde(default)]
    pub weight: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl InventoryEntry {
    pub fn from_rendered(r: &RenderedResource) -> Self {
        Self {
            identity: r.identity.clone(),
            component: r.component.clone(),
            weight: r.weight,
            checksum: Some(crate::digest::content_checksum(&r.content)),
        }
    }

    /// Full identity: everything but the API version, component included.
    pub fn full_identity_eq(&self, other: &InventoryEntry) -> bool {
        self.component == other.component && self.identity.same_object(&other.identity)
    }

    /// Cluster identity: group/version/kind/namespace/name, component ignored.
    pub fn cluster_identity_eq(&self, other: &InventoryEntry) -> bool {
        self.identity.same_gvk_object(&other.identity)
    }

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

/// One historical change record. Never mutated once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    #[serde(rename = "changeID")]
    pub change_id: String,
    pub timestamp: DateTime<Utc>,
    pub digest: String,
    pub source: ChangeSource,
    #[serde(default)]
    pub entries: Vec<InventoryEntry>,
}

/// Release-identifying metadata, fixed at first apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InventoryMetadata {
    pub name: String,
    pub namespace: String,
    pub module: String,
    #[serde(default, rename = "releaseID", skip_serializing_if = "Option::is_none")]
    pub release_id: Option<String>,
}

/// Aggregate root persisted once per release.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Inventory {
    #[serde(flatten)]
    pub metadata: InventoryMetadata,
    /// Live snapshot: the entries of the most recent change.
    #[serde(default)]
    pub entries: Vec<InventoryEntry>,
    /// Most recent first.
    #[serde(default)]
    pub history: Vec<ChangeEntry>,
    /// Change ids mirroring `history` order.
    #[serde(default)]
    pub index: Vec<String>,
    /// Optimistic-concurrency token of the stored record; `None` until first persisted.
    #[serde(skip)]
    pub resource_version: Option<String>,
}

impl Inventory {
    pub fn new(metadata: InventoryMetadata) -> Self {
        Self { metadata, ..Default::default() }
    }

    pub fn current_change(&self) -> Option<&ChangeEntry> {
        self.history.first()
    }

    pub fn current_change_id(&self) -> Option<&str> {
        self.index.first().map(|s| s.as_str())
    }

    pub fn is_current(&self, change_id: &str) -> bool {
        self.current_change_id() == Some(change_id)
    }

    pub fn contains(&self, identity: &ResourceIdentity) -> bool {
        self.entries.iter().any(|e| e.identity.same_object(identity))
    }

    /// Record a change at the head of history. Re-recording an existing change id moves it
    /// to the head instead of duplicating it; history is then bounded by `max_history`.
    pub fn record_change(&mut self, change: ChangeEntry, max_history: usize) {
        let index = std::mem::take(&mut self.index);
        self.index = update_index(index, &change.change_id);
        self.history.retain(|c| c.change_id != change.change_id);
        self.entries = change.entries.clone();
        self.history.insert(0, change);
        prune_history(self, max_history);
    }
}
