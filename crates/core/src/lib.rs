//! Keel core types: resource identity, manifest digests, change history and the
//! release inventory record.

#![forbid(unsafe_code)]

pub mod change;
pub mod collab;
pub mod digest;
pub mod error;
pub mod identity;
pub mod inventory;

pub use change::{compute_change_id, prepare_change, prune_history, update_index};
pub use collab::{Cluster, LiveResource, Renderer};
pub use digest::{compute_manifest_digest, content_checksum, sort_resources, values_fingerprint};
pub use error::{PreApplyViolation, ReleaseError, ResourceFailure, ViolationKind};
pub use identity::{RenderedResource, ResourceIdentity};
pub use inventory::{ChangeEntry, ChangeSource, Inventory, InventoryEntry, InventoryMetadata, ModuleRef};

pub mod prelude {
    pub use super::{
        ChangeEntry, ChangeSource, Cluster, Inventory, InventoryEntry, InventoryMetadata, LiveResource, ModuleRef,
        ReleaseError, RenderedResource, Renderer, ResourceIdentity,
    };
}

/// Label keys stamped on applied resources and on the inventory record.
pub mod labels {
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    pub const MANAGER: &str = "keel";
    pub const RELEASE_NAME: &str = "keel.dev/release-name";
    pub const RELEASE_NAMESPACE: &str = "keel.dev/release-namespace";
    pub const RELEASE_ID: &str = "keel.dev/release-id";
    pub const COMPONENT: &str = "keel.dev/component";
    /// Component value carried by the inventory record itself, so workload scans can skip it.
    pub const INVENTORY_COMPONENT: &str = "inventory";
}
