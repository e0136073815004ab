//! Deletion of stale resources in reverse apply order.

use keel_core::{Cluster, InventoryEntry, ReleaseError, ResourceFailure};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::guarded;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PruneReport {
    /// Deleted, or already gone.
    pub deleted: Vec<InventoryEntry>,
    /// Left in the cluster and no longer tracked (namespaces, or pruning disabled).
    pub released: Vec<InventoryEntry>,
    /// Delete failed; callers keep tracking these so the next run retries.
    pub failed: Vec<(InventoryEntry, String)>,
}

impl PruneReport {
    /// Report for a run with pruning disabled.
    pub fn skipped(stale: Vec<InventoryEntry>) -> Self {
        Self { released: stale, ..Default::default() }
    }

    pub fn failures(&self) -> Vec<ResourceFailure> {
        self.failed
            .iter()
            .map(|(e, msg)| ResourceFailure { identity: e.identity.clone(), message: msg.clone() })
            .collect()
    }
}

/// Sort into teardown order: the reverse of apply order, so dependents go before dependencies.
pub fn teardown_order(entries: &mut [InventoryEntry]) {
    entries.sort_by(|a, b| {
        b.sort_key()
            .cmp(&a.sort_key())
            .then_with(|| b.identity.version.cmp(&a.identity.version))
            .then_with(|| b.component.cmp(&a.component))
    });
}

/// Delete `stale` one by one in teardown order. Not-found counts as deleted. Namespaces are
/// released instead of deleted unless `prune_namespaces` is set.
///
/// After a failed delete, entries ordered strictly below it are not attempted: they may be what
/// the failed object depends on (its CRD, its namespace). They land in `failed` so callers keep
/// tracking them.
pub async fn prune_stale_resources(
    cluster: &dyn Cluster,
    mut stale: Vec<InventoryEntry>,
    prune_namespaces: bool,
    cancel: &CancellationToken,
) -> Result<PruneReport, ReleaseError> {
    teardown_order(&mut stale);
    let mut report = PruneReport::default();
    let mut blocker: Option<InventoryEntry> = None;
    for entry in stale {
        if entry.identity.is_namespace() && !prune_namespaces {
            debug!(resource = %entry.identity, "namespace excluded from pruning");
            report.released.push(entry);
            continue;
        }
        if let Some(b) = blocker.as_ref().filter(|b| entry.sort_key() < b.sort_key()) {
            debug!(resource = %entry.identity, blocked_by = %b.identity, "deletion deferred");
            let msg = format!("not attempted: {} must be deleted first", b.identity);
            report.failed.push((entry, msg));
            continue;
        }
        match guarded(cancel, cluster.delete(&entry.identity)).await? {
            Ok(()) => {
                counter!("release_prune_total", 1u64);
                report.deleted.push(entry);
            }
            Err(e) => {
                counter!("release_prune_err", 1u64);
                if blocker.is_none() {
                    blocker = Some(entry.clone());
                }
                report.failed.push((entry, format!("{:#}", e)));
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ResourceIdentity;

    fn entry(weight: i32, kind: &str, name: &str) -> InventoryEntry {
        InventoryEntry {
            identity: ResourceIdentity::new("", "v1", kind, if kind == "Namespace" { "" } else { "team" }, name),
            component: "app".into(),
            weight,
            checksum: None,
        }
    }

    #[test]
    fn teardown_reverses_apply_order() {
        let mut items = vec![entry(-100, "Namespace", "team"), entry(0, "Service", "web"), entry(-20, "ConfigMap", "cfg"), entry(0, "ConfigMap", "a")];
        teardown_order(&mut items);
        let names: Vec<_> = items.iter().map(|e| e.identity.name.as_str()).collect();
        assert_eq!(names, vec!["web", "a", "cfg", "team"]);
    }

    struct FailOn {
        name: &'static str,
        deleted: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Cluster for FailOn {
        async fn get(&self, _: &ResourceIdentity) -> anyhow::Result<Option<keel_core::LiveResource>> {
            Ok(None)
        }
        async fn apply(&self, _: &keel_core::RenderedResource) -> anyhow::Result<()> {
            Ok(())
        }
        async fn delete(&self, id: &ResourceIdentity) -> anyhow::Result<()> {
            if id.name == self.name {
                anyhow::bail!("finalizer stuck on {}", id.name);
            }
            self.deleted.lock().unwrap().push(id.name.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_delete_defers_everything_ordered_below_it() {
        let crd = InventoryEntry {
            identity: ResourceIdentity::new("apiextensions.k8s.io", "v1", "CustomResourceDefinition", "", "widgets.example.com"),
            component: "crds".into(),
            weight: -90,
            checksum: None,
        };
        let widget = InventoryEntry {
            identity: ResourceIdentity::new("example.com", "v1", "Widget", "team", "w1"),
            component: "app".into(),
            weight: 0,
            checksum: None,
        };
        let stale = vec![crd, widget, entry(-100, "Namespace", "team"), entry(0, "Service", "web"), entry(10, "ConfigMap", "late")];
        let cluster = FailOn { name: "w1", deleted: Default::default() };

        let report = prune_stale_resources(&cluster, stale, true, &CancellationToken::new()).await.unwrap();

        assert_eq!(*cluster.deleted.lock().unwrap(), vec!["late"]);
        let failed: Vec<_> = report.failed.iter().map(|(e, _)| e.identity.name.as_str()).collect();
        assert_eq!(failed, vec!["w1", "web", "widgets.example.com", "team"]);
        assert!(report.failed[2].1.contains("must be deleted first"), "{}", report.failed[2].1);
        assert_eq!(report.failures().len(), 4);
    }
}
