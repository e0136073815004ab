use std::time::Instant;

use k8s_openapi::api::core::v1::Secret;
use keel_core::Inventory;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use metrics::{counter, histogram};
use tracing::debug;

use crate::{decode_secret, encode_secret, inventory_name, release_id_selector, InventoryStore, StoreError, StoreResult};

/// Inventory stored as a Secret in the release namespace.
pub struct SecretStore {
    client: Client,
}

impl SecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn find(&self, name: &str, namespace: &str, release_id: Option<&str>) -> StoreResult<Option<Secret>> {
        let api = self.api(namespace);
        if let Some(secret) = api.get_opt(&inventory_name(name)).await.map_err(backend)? {
            return Ok(Some(secret));
        }
        let Some(id) = release_id else { return Ok(None) };
        let lp = ListParams::default().labels(&release_id_selector(id));
        let mut found = api.list(&lp).await.map_err(backend)?.items;
        debug!(release = %name, ns = %namespace, release_id = %id, matches = found.len(), "inventory label lookup");
        Ok(if found.is_empty() { None } else { Some(found.remove(0)) })
    }
}

fn backend(e: kube::Error) -> StoreError {
    StoreError::Backend(Box::new(e))
}

fn status_code(e: &kube::Error) -> Option<u16> {
    match e {
        kube::Error::Api(resp) => Some(resp.code),
        _ => None,
    }
}

/// 409 covers both a stale resourceVersion on replace and AlreadyExists on create.
/// A 404 on replace means the record was deleted since it was read.
fn is_write_conflict(e: &kube::Error, replacing: bool) -> bool {
    match status_code(e) {
        Some(409) => true,
        Some(404) => replacing,
        _ => false,
    }
}

#[async_trait::async_trait]
impl InventoryStore for SecretStore {
    async fn get(&self, name: &str, namespace: &str, release_id: Option<&str>) -> StoreResult<Option<Inventory>> {
        let started = Instant::now();
        let found = self.find(name, namespace, release_id).await?;
        histogram!("inventory_read_ms", started.elapsed().as_secs_f64() * 1000.0);
        found.as_ref().map(decode_secret).transpose()
    }

    async fn write(&self, inventory: &mut Inventory) -> StoreResult<()> {
        let started = Instant::now();
        let secret = encode_secret(inventory)?;
        let name = inventory_name(&inventory.metadata.name);
        let api = self.api(&inventory.metadata.namespace);
        let res = match inventory.resource_version {
            None => api.create(&PostParams::default(), &secret).await,
            Some(_) => api.replace(&name, &PostParams::default(), &secret).await,
        };
        match res {
            Ok(stored) => {
                inventory.resource_version = stored.metadata.resource_version;
                histogram!("inventory_write_ms", started.elapsed().as_secs_f64() * 1000.0);
                counter!("inventory_write_total", 1u64);
                Ok(())
            }
            Err(e) if is_write_conflict(&e, inventory.resource_version.is_some()) => {
                counter!("inventory_conflict_total", 1u64);
                Err(StoreError::Conflict {
                    name: inventory.metadata.name.clone(),
                    namespace: inventory.metadata.namespace.clone(),
                })
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn delete(&self, name: &str, namespace: &str, release_id: Option<&str>) -> StoreResult<()> {
        let Some(secret) = self.find(name, namespace, release_id).await? else {
            return Ok(());
        };
        let secret_name = secret.metadata.name.unwrap_or_else(|| inventory_name(name));
        match self.api(namespace).delete(&secret_name, &DeleteParams::default()).await {
            Ok(_) => {
                counter!("inventory_delete_total", 1u64);
                Ok(())
            }
            Err(e) if status_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(backend(e)),
        }
    }
}
