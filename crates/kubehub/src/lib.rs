//! Keel kubehub: API discovery and targeted object access over dynamic types.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use keel_core::{digest::normalize, Cluster, LiveResource, RenderedResource, ResourceIdentity};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Build a client from the ambient kubeconfig or in-cluster environment.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client")
}

#[derive(Debug, Clone)]
struct Served {
    ar: ApiResource,
    namespaced: bool,
}

async fn discover_served(client: Client) -> Result<Vec<Served>> {
    let discovery = Discovery::new(client).run().await.context("running API discovery")?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(Served { ar, namespaced: matches!(caps.scope, Scope::Namespaced) });
        }
    }
    Ok(out)
}

/// Prefer the exact group/version/kind; otherwise the served version of the same group/kind,
/// since an object keeps its identity across API versions.
fn pick<'a>(served: &'a [Served], id: &ResourceIdentity) -> Option<&'a Served> {
    served
        .iter()
        .find(|s| s.ar.group == id.group && s.ar.version == id.version && s.ar.kind == id.kind)
        .or_else(|| served.iter().find(|s| s.ar.group == id.group && s.ar.kind == id.kind))
}

/// [`Cluster`] backed by the Kubernetes API with server-side apply.
pub struct KubeCluster {
    client: Client,
    field_manager: String,
    served: Mutex<Option<Vec<Served>>>,
}

impl KubeCluster {
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self { client, field_manager: field_manager.to_string(), served: Mutex::new(None) }
    }

    /// Resolve the API resource for an identity. A miss re-runs discovery once, which picks up
    /// CRDs applied earlier in the same run. `Ok(None)` means the kind is not served.
    async fn resolve(&self, id: &ResourceIdentity) -> Result<Option<Served>> {
        let mut guard = self.served.lock().await;
        if let Some(served) = guard.as_ref() {
            if let Some(hit) = pick(served, id) {
                return Ok(Some(hit.clone()));
            }
        }
        debug!(gvk = %format!("{}/{}", id.api_version(), id.kind), "refreshing API discovery");
        let fresh = discover_served(self.client.clone()).await?;
        let hit = pick(&fresh, id).cloned();
        *guard = Some(fresh);
        Ok(hit)
    }

    fn api_for(&self, served: &Served, id: &ResourceIdentity) -> Result<Api<DynamicObject>> {
        if served.namespaced {
            if id.namespace.is_empty() {
                return Err(anyhow!("namespace required for namespaced kind {}", id.kind));
            }
            Ok(Api::namespaced_with(self.client.clone(), &id.namespace, &served.ar))
        } else {
            Ok(Api::all_with(self.client.clone(), &served.ar))
        }
    }
}

fn status_code(e: &kube::Error) -> Option<u16> {
    match e {
        kube::Error::Api(resp) => Some(resp.code),
        _ => None,
    }
}

fn live_from(id: &ResourceIdentity, obj: DynamicObject) -> Result<LiveResource> {
    let labels = obj.metadata.labels.clone().unwrap_or_default().into_iter().collect();
    let terminating = obj.metadata.deletion_timestamp.is_some();
    let content = serde_json::to_value(&obj).context("serializing DynamicObject")?;
    Ok(LiveResource { identity: id.clone(), labels, terminating, content: normalize(&content) })
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<LiveResource>> {
        counter!("cluster_get_total", 1u64);
        let Some(served) = self.resolve(identity).await? else {
            debug!(resource = %identity, "kind not served; treating as absent");
            return Ok(None);
        };
        let api = self.api_for(&served, identity)?;
        match api.get_opt(&identity.name).await.with_context(|| format!("getting {}", identity))? {
            Some(obj) => Ok(Some(live_from(identity, obj)?)),
            None => Ok(None),
        }
    }

    async fn apply(&self, resource: &RenderedResource) -> Result<()> {
        let id = &resource.identity;
        let served = self
            .resolve(id)
            .await?
            .ok_or_else(|| anyhow!("GVK not found: {}/{}", id.api_version(), id.kind))?;
        let api = self.api_for(&served, id)?;
        let pp = PatchParams::apply(&self.field_manager).force();
        match api.patch(&id.name, &pp, &Patch::Apply(&resource.content)).await {
            Ok(_) => {
                counter!("cluster_apply_total", 1u64);
                Ok(())
            }
            Err(e) => {
                counter!("cluster_apply_err", 1u64);
                Err(anyhow!("server-side apply of {} failed: {}", id, e))
            }
        }
    }

    async fn delete(&self, identity: &ResourceIdentity) -> Result<()> {
        let Some(served) = self.resolve(identity).await? else {
            warn!(resource = %identity, "kind no longer served; nothing to delete");
            return Ok(());
        };
        let api = self.api_for(&served, identity)?;
        match api.delete(&identity.name, &DeleteParams::background()).await {
            Ok(_) => {
                counter!("cluster_delete_total", 1u64);
                Ok(())
            }
            Err(e) if status_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(anyhow!("deleting {} failed: {}", identity, e)),
        }
    }
}
