//! Keel persistence: one inventory record per release, guarded by a resource-version token.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use keel_core::{labels, Inventory};

mod kube_store;
mod memory;

pub use kube_store::SecretStore;
pub use memory::MemoryStore;

/// Data key holding the JSON-encoded inventory.
pub const INVENTORY_KEY: &str = "inventory";
pub const INVENTORY_SECRET_TYPE: &str = "keel.dev/inventory";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("inventory {namespace}/{name} was modified concurrently")]
    Conflict { name: String, namespace: String },
    #[error("inventory {namespace}/{name} is malformed: {reason}")]
    Malformed { name: String, namespace: String, reason: String },
    #[error("inventory backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Inventory CRUD. Absence is `Ok(None)`, never an error.
#[async_trait::async_trait]
pub trait InventoryStore: Send + Sync {
    /// Lookup by naming convention, falling back to a label lookup scoped to `release_id`.
    async fn get(&self, name: &str, namespace: &str, release_id: Option<&str>) -> StoreResult<Option<Inventory>>;

    /// Create when `inventory.resource_version` is `None`, otherwise replace only if the stored
    /// token still matches. On success the token is refreshed in place.
    async fn write(&self, inventory: &mut Inventory) -> StoreResult<()>;

    /// Idempotent: deleting an absent record succeeds.
    async fn delete(&self, name: &str, namespace: &str, release_id: Option<&str>) -> StoreResult<()>;
}

/// Record name for a release; it lives in the release namespace.
pub fn inventory_name(release_name: &str) -> String {
    format!("keel.{}", release_name)
}

/// Label selector for the fallback lookup.
pub fn release_id_selector(release_id: &str) -> String {
    format!("{}={},{}={}", labels::RELEASE_ID, release_id, labels::COMPONENT, labels::INVENTORY_COMPONENT)
}

pub fn inventory_labels(inv: &Inventory) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    out.insert(labels::MANAGED_BY.to_string(), labels::MANAGER.to_string());
    out.insert(labels::RELEASE_NAME.to_string(), inv.metadata.name.clone());
    out.insert(labels::RELEASE_NAMESPACE.to_string(), inv.metadata.namespace.clone());
    out.insert(labels::COMPONENT.to_string(), labels::INVENTORY_COMPONENT.to_string());
    if let Some(id) = &inv.metadata.release_id {
        out.insert(labels::RELEASE_ID.to_string(), id.clone());
    }
    out
}

/// Encode an inventory into its Secret form. Labels are rewritten on every write, which
/// also repairs label drift on existing records.
pub fn encode_secret(inv: &Inventory) -> StoreResult<Secret> {
    let body = serde_json::to_vec(inv).map_err(|e| StoreError::Malformed {
        name: inv.metadata.name.clone(),
        namespace: inv.metadata.namespace.clone(),
        reason: e.to_string(),
    })?;
    let mut data = BTreeMap::new();
    data.insert(INVENTORY_KEY.to_string(), ByteString(body));
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(inventory_name(&inv.metadata.name)),
            namespace: Some(inv.metadata.namespace.clone()),
            labels: Some(inventory_labels(inv)),
            resource_version: inv.resource_version.clone(),
            ..Default::default()
        },
        type_: Some(INVENTORY_SECRET_TYPE.to_string()),
        data: Some(data),
        ..Default::default()
    })
}

pub fn decode_secret(secret: &Secret) -> StoreResult<Inventory> {
    let name = secret.metadata.name.clone().unwrap_or_default();
    let namespace = secret.metadata.namespace.clone().unwrap_or_default();
    let malformed = |reason: String| StoreError::Malformed { name: name.clone(), namespace: namespace.clone(), reason };

    let body: Vec<u8> = match secret.data.as_ref().and_then(|d| d.get(INVENTORY_KEY)) {
        Some(bytes) => bytes.0.clone(),
        None => match secret.string_data.as_ref().and_then(|d| d.get(INVENTORY_KEY)) {
            Some(s) => s.clone().into_bytes(),
            None => return Err(malformed(format!("missing {:?} data key", INVENTORY_KEY))),
        },
    };
    let mut inv: Inventory = serde_json::from_slice(&body).map_err(|e| malformed(e.to_string()))?;
    inv.resource_version = secret.metadata.resource_version.clone();
    Ok(inv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{InventoryEntry, InventoryMetadata, ResourceIdentity};

    fn sample() -> Inventory {
        let mut inv = Inventory::new(InventoryMetadata {
            name: "web".into(),
            namespace: "prod".into(),
            module: "webapp".into(),
            release_id: Some("3f1c".into()),
        });
        inv.entries.push(InventoryEntry {
            identity: ResourceIdentity::new("apps", "v1", "Deployment", "prod", "web"),
            component: "app".into(),
            weight: 0,
            checksum: None,
        });
        inv
    }

    #[test]
    fn secret_carries_identifying_labels() {
        let secret = encode_secret(&sample()).unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("keel.web"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("prod"));
        let l = secret.metadata.labels.unwrap();
        assert_eq!(l.get(labels::MANAGED_BY).map(String::as_str), Some("keel"));
        assert_eq!(l.get(labels::RELEASE_NAME).map(String::as_str), Some("web"));
        assert_eq!(l.get(labels::RELEASE_NAMESPACE).map(String::as_str), Some("prod"));
        assert_eq!(l.get(labels::COMPONENT).map(String::as_str), Some("inventory"));
        assert_eq!(l.get(labels::RELEASE_ID).map(String::as_str), Some("3f1c"));
    }

    #[test]
    fn decode_restores_version_token() {
        let mut secret = encode_secret(&sample()).unwrap();
        secret.metadata.resource_version = Some("77".into());
        let inv = decode_secret(&secret).unwrap();
        assert_eq!(inv.resource_version.as_deref(), Some("77"));
        assert_eq!(inv.entries, sample().entries);
    }

    #[test]
    fn decode_rejects_missing_payload() {
        let mut secret = encode_secret(&sample()).unwrap();
        secret.data = None;
        let err = decode_secret(&secret).unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }), "{err}");
    }
}
