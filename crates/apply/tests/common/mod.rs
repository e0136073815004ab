#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use keel_apply::{ApplyRequest, ReleaseEngine, ReleaseSelector};
use keel_core::{Cluster, Inventory, LiveResource, ModuleRef, RenderedResource, Renderer, ResourceIdentity};
use keel_persist::{InventoryStore, MemoryStore, StoreResult};
use serde_json::{json, Value as Json};
use tokio_util::sync::CancellationToken;

pub const NS: &str = "prod";
pub const RELEASE: &str = "web";

fn rendered(api_version: &str, kind: &str, namespace: &str, name: &str, component: &str, weight: i32, body: Json) -> RenderedResource {
    let identity = ResourceIdentity::from_api_version(api_version, kind, namespace, name);
    let mut metadata = json!({ "name": name });
    if !namespace.is_empty() {
        metadata["namespace"] = json!(namespace);
    }
    let mut content = json!({ "apiVersion": api_version, "kind": kind, "metadata": metadata });
    if let (Some(obj), Some(extra)) = (content.as_object_mut(), body.as_object()) {
        for (k, v) in extra {
            obj.insert(k.clone(), v.clone());
        }
    }
    RenderedResource { identity, component: component.to_string(), weight, content }
}

pub fn namespace(name: &str) -> RenderedResource {
    rendered("v1", "Namespace", "", name, "base", -100, json!({}))
}

pub fn config_map(name: &str, value: &str) -> RenderedResource {
    rendered("v1", "ConfigMap", NS, name, "app", -20, json!({ "data": { "value": value } }))
}

pub fn service(name: &str) -> RenderedResource {
    rendered("v1", "Service", NS, name, "app", 0, json!({ "spec": { "ports": [ { "port": 80 } ] } }))
}

pub fn deployment(name: &str, component: &str) -> RenderedResource {
    rendered("apps/v1", "Deployment", NS, name, component, 0, json!({ "spec": { "replicas": 2 } }))
}

pub fn widget_crd() -> RenderedResource {
    rendered(
        "apiextensions.k8s.io/v1",
        "CustomResourceDefinition",
        "",
        "widgets.example.com",
        "crds",
        -90,
        json!({ "spec": { "group": "example.com", "names": { "kind": "Widget", "plural": "widgets" } } }),
    )
}

pub fn widget(name: &str) -> RenderedResource {
    rendered("example.com/v1", "Widget", NS, name, "app", 0, json!({ "spec": { "size": 1 } }))
}

type Key = (String, String, String, String);

/// The API server resolves every served version of a group/kind to the same object.
fn key(id: &ResourceIdentity) -> Key {
    (id.group.clone(), id.kind.clone(), id.namespace.clone(), id.name.clone())
}

#[derive(Default)]
struct ClusterState {
    objects: BTreeMap<Key, LiveResource>,
    applied: Vec<ResourceIdentity>,
    deleted: Vec<ResourceIdentity>,
    fail_apply: BTreeSet<String>,
    fail_delete: BTreeSet<String>,
    cancel_after: Option<(usize, CancellationToken)>,
}

/// In-memory cluster with failure injection and a call log.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    pub fn fail_apply_on(&self, name: &str) {
        self.lock().fail_apply.insert(name.to_string());
    }

    pub fn fail_delete_on(&self, name: &str) {
        self.lock().fail_delete.insert(name.to_string());
    }

    pub fn clear_failures(&self) {
        let mut s = self.lock();
        s.fail_apply.clear();
        s.fail_delete.clear();
    }

    /// Cancel `token` once `applies` apply calls have gone through.
    pub fn cancel_after_applies(&self, applies: usize, token: CancellationToken) {
        self.lock().cancel_after = Some((applies, token));
    }

    /// Place an object as if another actor created it.
    pub fn seed(&self, resource: &RenderedResource, labels: &[(&str, &str)], terminating: bool) {
        let live = LiveResource {
            identity: resource.identity.clone(),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            terminating,
            content: resource.content.clone(),
        };
        self.lock().objects.insert(key(&resource.identity), live);
    }

    pub fn mark_terminating(&self, id: &ResourceIdentity) {
        if let Some(o) = self.lock().objects.get_mut(&key(id)) {
            o.terminating = true;
        }
    }

    pub fn remove(&self, id: &ResourceIdentity) {
        self.lock().objects.remove(&key(id));
    }

    pub fn live(&self, id: &ResourceIdentity) -> Option<LiveResource> {
        self.lock().objects.get(&key(id)).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().objects.values().map(|o| o.identity.name.clone()).collect()
    }

    pub fn applied(&self) -> Vec<ResourceIdentity> {
        self.lock().applied.clone()
    }

    pub fn deleted(&self) -> Vec<ResourceIdentity> {
        self.lock().deleted.clone()
    }
}

#[async_trait::async_trait]
impl Cluster for FakeCluster {
    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<LiveResource>> {
        Ok(self.live(identity))
    }

    async fn apply(&self, resource: &RenderedResource) -> Result<()> {
        let mut s = self.lock();
        if s.fail_apply.contains(&resource.identity.name) {
            return Err(anyhow!("admission webhook denied {}", resource.identity.name));
        }
        let labels = resource.content["metadata"]["labels"]
            .as_object()
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string()))).collect())
            .unwrap_or_default();
        s.objects.insert(
            key(&resource.identity),
            LiveResource { identity: resource.identity.clone(), labels, terminating: false, content: resource.content.clone() },
        );
        s.applied.push(resource.identity.clone());
        if let Some((n, token)) = &s.cancel_after {
            if s.applied.len() >= *n {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn delete(&self, identity: &ResourceIdentity) -> Result<()> {
        let mut s = self.lock();
        if s.fail_delete.contains(&identity.name) {
            return Err(anyhow!("delete of {} forbidden", identity.name));
        }
        if s.objects.remove(&key(identity)).is_some() {
            s.deleted.push(identity.clone());
        }
        Ok(())
    }
}

/// Renders whatever was last set; `None` simulates a template failure.
#[derive(Default)]
pub struct FakeRenderer {
    output: Mutex<Option<Vec<RenderedResource>>>,
}

impl FakeRenderer {
    pub fn set(&self, resources: Vec<RenderedResource>) {
        *self.output.lock().unwrap() = Some(resources);
    }

    pub fn break_template(&self) {
        *self.output.lock().unwrap() = None;
    }
}

#[async_trait::async_trait]
impl Renderer for FakeRenderer {
    async fn render(&self, _module: &ModuleRef, _values: &Json) -> Result<Vec<RenderedResource>> {
        self.output.lock().unwrap().clone().ok_or_else(|| anyhow!("template: undefined value .image"))
    }
}

/// Simulates a concurrent writer landing between our read and our write.
#[derive(Default)]
pub struct RacingStore {
    pub inner: MemoryStore,
}

#[async_trait::async_trait]
impl InventoryStore for RacingStore {
    async fn get(&self, name: &str, namespace: &str, release_id: Option<&str>) -> StoreResult<Option<Inventory>> {
        let found = self.inner.get(name, namespace, release_id).await?;
        if let Some(mut other) = found.clone() {
            self.inner.write(&mut other).await?;
        }
        Ok(found)
    }

    async fn write(&self, inventory: &mut Inventory) -> StoreResult<()> {
        self.inner.write(inventory).await
    }

    async fn delete(&self, name: &str, namespace: &str, release_id: Option<&str>) -> StoreResult<()> {
        self.inner.delete(name, namespace, release_id).await
    }
}

pub struct Harness {
    pub renderer: Arc<FakeRenderer>,
    pub cluster: Arc<FakeCluster>,
    pub store: Arc<MemoryStore>,
    pub engine: ReleaseEngine,
}

impl Harness {
    pub fn new() -> Self {
        let renderer = Arc::new(FakeRenderer::default());
        let cluster = Arc::new(FakeCluster::default());
        let store = Arc::new(MemoryStore::new());
        let engine = ReleaseEngine::new(renderer.clone(), cluster.clone(), store.clone());
        Self { renderer, cluster, store, engine }
    }

    pub async fn inventory(&self) -> Option<Inventory> {
        self.store.get(RELEASE, NS, None).await.unwrap()
    }
}

pub fn selector() -> ReleaseSelector {
    ReleaseSelector::new(RELEASE, NS)
}

pub fn request() -> ApplyRequest {
    ApplyRequest {
        release: selector(),
        module: ModuleRef { name: "webapp".into(), path: "modules/webapp".into(), version: Some("1.2.0".into()) },
        values: json!({ "replicas": 2 }),
    }
}

pub fn names(ids: &[ResourceIdentity]) -> Vec<String> {
    ids.iter().map(|i| format!("{}/{}", i.kind, i.name)).collect()
}
