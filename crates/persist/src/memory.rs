use std::collections::BTreeMap;
use std::sync::Mutex;

use keel_core::Inventory;
use metrics::counter;

use crate::{decode_secret, encode_secret, InventoryStore, StoreError, StoreResult};
use k8s_openapi::api::core::v1::Secret;

/// In-process store with the same encoding and version-token rules as [`crate::SecretStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<State>,
}

#[derive(Default)]
struct State {
    next_rv: u64,
    records: BTreeMap<(String, String), Secret>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn key(name: &str, namespace: &str) -> (String, String) {
        (namespace.to_string(), name.to_string())
    }

    fn find(state: &State, name: &str, namespace: &str, release_id: Option<&str>) -> StoreResult<Option<(String, String)>> {
        let key = Self::key(name, namespace);
        if state.records.contains_key(&key) {
            return Ok(Some(key));
        }
        let Some(id) = release_id else { return Ok(None) };
        for (k, secret) in state.records.iter().filter(|(k, _)| k.0 == namespace) {
            if decode_secret(secret)?.metadata.release_id.as_deref() == Some(id) {
                return Ok(Some(k.clone()));
            }
        }
        Ok(None)
    }
}

#[async_trait::async_trait]
impl InventoryStore for MemoryStore {
    async fn get(&self, name: &str, namespace: &str, release_id: Option<&str>) -> StoreResult<Option<Inventory>> {
        let state = self.lock();
        match Self::find(&state, name, namespace, release_id)? {
            Some(key) => state.records.get(&key).map(decode_secret).transpose(),
            None => Ok(None),
        }
    }

    async fn write(&self, inventory: &mut Inventory) -> StoreResult<()> {
        let mut state = self.lock();
        let key = Self::key(&inventory.metadata.name, &inventory.metadata.namespace);
        let stored_rv = state.records.get(&key).and_then(|s| s.metadata.resource_version.clone());
        if stored_rv != inventory.resource_version {
            counter!("inventory_conflict_total", 1u64);
            return Err(StoreError::Conflict {
                name: inventory.metadata.name.clone(),
                namespace: inventory.metadata.namespace.clone(),
            });
        }
        state.next_rv += 1;
        let rv = state.next_rv.to_string();
        let mut secret = encode_secret(inventory)?;
        secret.metadata.resource_version = Some(rv.clone());
        state.records.insert(key, secret);
        inventory.resource_version = Some(rv);
        counter!("inventory_write_total", 1u64);
        Ok(())
    }

    async fn delete(&self, name: &str, namespace: &str, release_id: Option<&str>) -> StoreResult<()> {
        let mut state = self.lock();
        if let Some(key) = Self::find(&state, name, namespace, release_id)? {
            state.records.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::InventoryMetadata;

    fn inv(name: &str, release_id: &str) -> Inventory {
        Inventory::new(InventoryMetadata {
            name: name.into(),
            namespace: "prod".into(),
            module: "webapp".into(),
            release_id: Some(release_id.into()),
        })
    }

    #[tokio::test]
    async fn absent_release_reads_as_none() {
        let store = MemoryStore::new();
        assert!(store.get("web", "prod", None).await.unwrap().is_none());
        assert!(store.get("web", "prod", Some("id")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_then_update_with_token() {
        let store = MemoryStore::new();
        let mut a = inv("web", "id-1");
        store.write(&mut a).await.unwrap();
        let rv1 = a.resource_version.clone();
        assert!(rv1.is_some());

        let mut read = store.get("web", "prod", None).await.unwrap().unwrap();
        assert_eq!(read.resource_version, rv1);
        read.index.push("c1".into());
        store.write(&mut read).await.unwrap();
        assert_ne!(read.resource_version, rv1);
        assert_eq!(store.get("web", "prod", None).await.unwrap().unwrap().index, vec!["c1"]);
    }

    #[tokio::test]
    async fn stale_token_is_a_conflict() {
        let store = MemoryStore::new();
        store.write(&mut inv("web", "id-1")).await.unwrap();
        let mut first = store.get("web", "prod", None).await.unwrap().unwrap();
        let mut second = first.clone();
        store.write(&mut first).await.unwrap();
        let err = store.write(&mut second).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }), "{err}");

        // Creating over an existing record is also a conflict.
        let err = store.write(&mut inv("web", "id-2")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }), "{err}");
    }

    #[tokio::test]
    async fn release_id_fallback_and_idempotent_delete() {
        let store = MemoryStore::new();
        store.write(&mut inv("web", "id-1")).await.unwrap();
        let found = store.get("renamed", "prod", Some("id-1")).await.unwrap();
        assert_eq!(found.map(|i| i.metadata.name), Some("web".to_string()));
        assert!(store.get("renamed", "prod", Some("other")).await.unwrap().is_none());

        store.delete("renamed", "prod", Some("id-1")).await.unwrap();
        assert!(store.is_empty());
        store.delete("web", "prod", None).await.unwrap();
    }
}
