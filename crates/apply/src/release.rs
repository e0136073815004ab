//! Release operations composed from render, digest, inventory, stale-set and cluster calls.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use keel_core::{
    compute_change_id, compute_manifest_digest, digest::normalize, prepare_change, sort_resources, values_fingerprint,
    ChangeEntry, ChangeSource, Cluster, Inventory, InventoryEntry, InventoryMetadata, ModuleRef, ReleaseError,
    RenderedResource, Renderer, ResourceFailure, ResourceIdentity,
};
use keel_persist::InventoryStore;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::config::ReleaseConfig;
use crate::discovery::{discover_from_inventory, lookup_all};
use crate::drift::{drift_summary, DriftSummary};
use crate::ownership::with_release_labels;
use crate::prune::{prune_stale_resources, PruneReport};
use crate::safety::pre_apply_existence_check;
use crate::stale::prune_candidates;
use crate::{guarded, store_error};

/// Names a release: name plus namespace, optionally narrowed by its release id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseSelector {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_id: Option<String>,
}

impl ReleaseSelector {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self { name: name.to_string(), namespace: namespace.to_string(), release_id: None }
    }

    pub fn with_release_id(mut self, release_id: Option<String>) -> Self {
        self.release_id = release_id;
        self
    }

    fn not_found(&self) -> ReleaseError {
        ReleaseError::ReleaseNotFound { name: self.name.clone(), namespace: self.namespace.clone() }
    }
}

/// What to render for a release.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub release: ReleaseSelector,
    pub module: ModuleRef,
    pub values: Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub name: String,
    pub namespace: String,
    pub change_id: String,
    pub digest: String,
    pub first_apply: bool,
    /// The change id was already the current one.
    pub unchanged: bool,
    pub applied: Vec<ResourceIdentity>,
    /// Existing objects taken over by this release.
    pub adopted: Vec<ResourceIdentity>,
    pub pruned: Vec<ResourceIdentity>,
    /// Stale but left in the cluster, no longer tracked.
    pub released: Vec<ResourceIdentity>,
    pub inventory: Inventory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModifiedResource {
    pub identity: ResourceIdentity,
    pub summary: DriftSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffReport {
    pub name: String,
    pub namespace: String,
    /// Change id an apply of this render would record.
    pub change_id: String,
    pub digest: String,
    pub deployed: bool,
    /// The prospective change id is already current.
    pub up_to_date: bool,
    pub added: Vec<ResourceIdentity>,
    pub modified: Vec<ModifiedResource>,
    pub unchanged: Vec<ResourceIdentity>,
    /// Tracked, no longer rendered, and still live.
    pub orphaned: Vec<InventoryEntry>,
}

impl DiffReport {
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.modified.is_empty() || !self.orphaned.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Live,
    Terminating,
    Missing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceStatus {
    pub entry: InventoryEntry,
    pub state: ResourceState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseStatus {
    pub metadata: InventoryMetadata,
    pub change_id: Option<String>,
    pub digest: Option<String>,
    pub module_version: Option<String>,
    pub last_applied: Option<DateTime<Utc>>,
    pub history: usize,
    pub resources: Vec<ResourceStatus>,
}

impl ReleaseStatus {
    pub fn healthy(&self) -> bool {
        self.resources.iter().all(|r| r.state == ResourceState::Live)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeleteOutcome {
    pub name: String,
    pub namespace: String,
    pub deleted: Vec<ResourceIdentity>,
    /// Namespaces left in place.
    pub released: Vec<ResourceIdentity>,
    pub already_gone: Vec<ResourceIdentity>,
}

fn ids(entries: &[InventoryEntry]) -> Vec<ResourceIdentity> {
    entries.iter().map(|e| e.identity.clone()).collect()
}

/// Two rendered resources naming the same object would make the inventory ambiguous.
fn reject_duplicates(resources: &[RenderedResource]) -> anyhow::Result<()> {
    let mut seen = BTreeSet::new();
    for r in resources {
        let id = &r.identity;
        if !seen.insert((id.group.as_str(), id.kind.as_str(), id.namespace.as_str(), id.name.as_str())) {
            return Err(anyhow!("duplicate resource {} in render output", id));
        }
    }
    Ok(())
}

/// Name and namespace of the release a selector landed on. A release-id lookup can find a
/// record stored under another name; the stored record wins.
fn resolved_release(sel: &ReleaseSelector, found: Option<&Inventory>) -> (String, String) {
    match found {
        Some(inv) => (inv.metadata.name.clone(), inv.metadata.namespace.clone()),
        None => (sel.name.clone(), sel.namespace.clone()),
    }
}

/// Apply/diff/delete/status over a renderer, a cluster and an inventory store.
pub struct ReleaseEngine {
    renderer: Arc<dyn Renderer>,
    cluster: Arc<dyn Cluster>,
    store: Arc<dyn InventoryStore>,
}

impl ReleaseEngine {
    pub fn new(renderer: Arc<dyn Renderer>, cluster: Arc<dyn Cluster>, store: Arc<dyn InventoryStore>) -> Self {
        Self { renderer, cluster, store }
    }

    async fn render(&self, req: &ApplyRequest, cancel: &CancellationToken) -> Result<Vec<RenderedResource>, ReleaseError> {
        let mut resources = guarded(cancel, self.renderer.render(&req.module, &req.values))
            .await?
            .map_err(|e| ReleaseError::render(&req.module.path, e))?;
        reject_duplicates(&resources).map_err(|e| ReleaseError::render(&req.module.path, e))?;
        sort_resources(&mut resources);
        Ok(resources)
    }

    async fn read_inventory(&self, sel: &ReleaseSelector, cancel: &CancellationToken) -> Result<Option<Inventory>, ReleaseError> {
        guarded(cancel, self.store.get(&sel.name, &sel.namespace, sel.release_id.as_deref()))
            .await?
            .map_err(store_error)
    }

    /// Render, apply in order, then prune and record the new inventory.
    ///
    /// Pruning and the inventory write only happen once every rendered resource was applied;
    /// on any earlier failure or cancellation the previous inventory stays authoritative.
    pub async fn apply_release(
        &self,
        req: &ApplyRequest,
        config: &ReleaseConfig,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome, ReleaseError> {
        let started = Instant::now();
        counter!("release_apply_total", 1u64);
        let res = self.reconcile(req, config, cancel).await;
        match &res {
            Ok(_) => {
                histogram!("release_apply_ms", started.elapsed().as_secs_f64() * 1000.0);
            }
            Err(_) => {
                counter!("release_apply_err", 1u64);
            }
        }
        res
    }

    async fn reconcile(
        &self,
        req: &ApplyRequest,
        config: &ReleaseConfig,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome, ReleaseError> {
        let sel = &req.release;
        let resources = self.render(req, cancel).await?;

        let digest = compute_manifest_digest(&resources);
        let previous = self.read_inventory(sel, cancel).await?;
        let (name, namespace) = resolved_release(sel, previous.as_ref());
        let source = ChangeSource {
            release_name: name.clone(),
            release_namespace: namespace.clone(),
            module: req.module.clone(),
            values_digest: values_fingerprint(&req.values),
        };
        let change_id =
            compute_change_id(&source.module.path, source.module.version.as_deref(), &source.values_digest, &digest);
        let entries: Vec<InventoryEntry> = resources.iter().map(InventoryEntry::from_rendered).collect();
        debug!(release = %name, ns = %namespace, change_id = %change_id, resources = resources.len(), "rendered release");

        let prev_entries: &[InventoryEntry] = previous.as_ref().map(|p| p.entries.as_slice()).unwrap_or(&[]);

        if resources.is_empty() && !prev_entries.is_empty() && !config.allow_empty {
            return Err(ReleaseError::EmptyRender {
                name: name.clone(),
                namespace: namespace.clone(),
                previous: prev_entries.len(),
            });
        }

        let stale = prune_candidates(prev_entries, &entries);
        debug!(release = %name, stale = stale.len(), "computed prune candidates");

        let adopted = pre_apply_existence_check(
            self.cluster.as_ref(),
            &resources,
            &name,
            &namespace,
            config.force,
            config.lookup_concurrency,
            cancel,
        )
        .await?;

        let total = resources.len();
        for (i, r) in resources.iter().enumerate() {
            let labelled = with_release_labels(r, &name, &namespace);
            if let Err(e) = guarded(cancel, self.cluster.apply(&labelled)).await? {
                return Err(ReleaseError::Apply {
                    applied: i,
                    total,
                    failure: ResourceFailure { identity: r.identity.clone(), message: format!("{:#}", e) },
                });
            }
        }

        let report = if config.prune {
            prune_stale_resources(self.cluster.as_ref(), stale, config.prune_namespaces, cancel).await?
        } else {
            PruneReport::skipped(stale)
        };

        // Failed deletions stay tracked so the next run sees them as stale again.
        let mut recorded = entries;
        recorded.extend(report.failed.iter().map(|(e, _)| e.clone()));
        recorded.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        let change = prepare_change(source, digest.clone(), recorded);

        let first_apply = previous.is_none();
        let unchanged = previous.as_ref().map(|p| p.is_current(&change_id)).unwrap_or(false);
        let mut inventory = previous.unwrap_or_else(|| {
            Inventory::new(InventoryMetadata {
                name: name.clone(),
                namespace: namespace.clone(),
                module: req.module.name.clone(),
                release_id: None,
            })
        });
        if inventory.metadata.release_id.is_none() {
            inventory.metadata.release_id = Some(sel.release_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string()));
        }
        inventory.record_change(change, config.max_history);
        guarded(cancel, self.store.write(&mut inventory)).await?.map_err(store_error)?;

        if !report.failed.is_empty() {
            return Err(ReleaseError::Prune { change_id, failures: report.failures() });
        }
        Ok(ApplyOutcome {
            name,
            namespace,
            change_id,
            digest,
            first_apply,
            unchanged,
            applied: resources.into_iter().map(|r| r.identity).collect(),
            adopted,
            pruned: ids(&report.deleted),
            released: ids(&report.released),
            inventory,
        })
    }

    /// Compare a fresh render with the live cluster and the inventory. Never mutates.
    pub async fn diff_release(
        &self,
        req: &ApplyRequest,
        config: &ReleaseConfig,
        cancel: &CancellationToken,
    ) -> Result<DiffReport, ReleaseError> {
        let sel = &req.release;
        let resources = self.render(req, cancel).await?;
        let digest = compute_manifest_digest(&resources);
        let change_id = compute_change_id(
            &req.module.path,
            req.module.version.as_deref(),
            &values_fingerprint(&req.values),
            &digest,
        );
        let previous = self.read_inventory(sel, cancel).await?;
        let (name, namespace) = resolved_release(sel, previous.as_ref());

        let desired_ids: Vec<&ResourceIdentity> = resources.iter().map(|r| &r.identity).collect();
        let found = lookup_all(self.cluster.as_ref(), &desired_ids, config.lookup_concurrency, cancel).await?;

        let mut report = DiffReport {
            name: name.clone(),
            namespace: namespace.clone(),
            change_id,
            digest,
            deployed: previous.is_some(),
            up_to_date: false,
            added: Vec::new(),
            modified: Vec::new(),
            unchanged: Vec::new(),
            orphaned: Vec::new(),
        };
        report.up_to_date = previous.as_ref().map(|p| p.is_current(&report.change_id)).unwrap_or(false);

        for (r, live) in resources.iter().zip(found) {
            match live {
                None => report.added.push(r.identity.clone()),
                Some(live) => {
                    let desired = with_release_labels(r, &name, &namespace);
                    let summary = drift_summary(&normalize(&desired.content), &live.content);
                    if summary.is_empty() {
                        report.unchanged.push(r.identity.clone());
                    } else {
                        report.modified.push(ModifiedResource { identity: r.identity.clone(), summary });
                    }
                }
            }
        }

        // No inventory means nothing deployed, hence no orphans.
        if let Some(prev) = &previous {
            let current: Vec<InventoryEntry> = resources.iter().map(InventoryEntry::from_rendered).collect();
            let stale = prune_candidates(&prev.entries, &current);
            let discovered = discover_from_inventory(self.cluster.as_ref(), &stale, config.lookup_concurrency, cancel).await?;
            report.orphaned = discovered.live.into_iter().map(|(e, _)| e).collect();
        }
        Ok(report)
    }

    /// Tear down every tracked resource in reverse apply order, then drop the inventory.
    /// The inventory is kept when any deletion fails so a retry sees the same set.
    pub async fn delete_release(
        &self,
        sel: &ReleaseSelector,
        config: &ReleaseConfig,
        cancel: &CancellationToken,
    ) -> Result<DeleteOutcome, ReleaseError> {
        let inventory = self.read_inventory(sel, cancel).await?.ok_or_else(|| sel.not_found())?;
        let discovered =
            discover_from_inventory(self.cluster.as_ref(), &inventory.entries, config.lookup_concurrency, cancel).await?;
        let live: Vec<InventoryEntry> = discovered.live.into_iter().map(|(e, _)| e).collect();
        let report = prune_stale_resources(self.cluster.as_ref(), live, config.prune_namespaces, cancel).await?;
        if !report.failed.is_empty() {
            return Err(ReleaseError::Prune {
                change_id: inventory.current_change_id().unwrap_or_default().to_string(),
                failures: report.failures(),
            });
        }

        let meta = &inventory.metadata;
        guarded(cancel, self.store.delete(&meta.name, &meta.namespace, meta.release_id.as_deref()))
            .await?
            .map_err(store_error)?;
        counter!("release_delete_total", 1u64);
        debug!(release = %meta.name, ns = %meta.namespace, deleted = report.deleted.len(), "release deleted");
        Ok(DeleteOutcome {
            name: meta.name.clone(),
            namespace: meta.namespace.clone(),
            deleted: ids(&report.deleted),
            released: ids(&report.released),
            already_gone: ids(&discovered.missing),
        })
    }

    /// Inventory plus one targeted lookup per tracked resource.
    pub async fn status_release(
        &self,
        sel: &ReleaseSelector,
        config: &ReleaseConfig,
        cancel: &CancellationToken,
    ) -> Result<ReleaseStatus, ReleaseError> {
        let inventory = self.read_inventory(sel, cancel).await?.ok_or_else(|| sel.not_found())?;
        let tracked: Vec<&ResourceIdentity> = inventory.entries.iter().map(|e| &e.identity).collect();
        let found = lookup_all(self.cluster.as_ref(), &tracked, config.lookup_concurrency, cancel).await?;
        let resources = inventory
            .entries
            .iter()
            .zip(found)
            .map(|(entry, live)| ResourceStatus {
                entry: entry.clone(),
                state: match live {
                    None => ResourceState::Missing,
                    Some(l) if l.terminating => ResourceState::Terminating,
                    Some(_) => ResourceState::Live,
                },
            })
            .collect();
        let current = inventory.current_change();
        Ok(ReleaseStatus {
            metadata: inventory.metadata.clone(),
            change_id: inventory.current_change_id().map(String::from),
            digest: current.map(|c| c.digest.clone()),
            module_version: current.and_then(|c| c.source.module.version.clone()),
            last_applied: current.map(|c| c.timestamp),
            history: inventory.history.len(),
            resources,
        })
    }

    /// Recorded changes, most recent first. Reads the inventory only.
    pub async fn release_history(
        &self,
        sel: &ReleaseSelector,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChangeEntry>, ReleaseError> {
        let inventory = self.read_inventory(sel, cancel).await?.ok_or_else(|| sel.not_found())?;
        Ok(inventory.history)
    }
}
