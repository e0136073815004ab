//! Targeted per-entry lookups in place of cluster-wide scans.

use futures::{stream, StreamExt, TryStreamExt};
use keel_core::{Cluster, InventoryEntry, LiveResource, ReleaseError, ResourceIdentity};
use tokio_util::sync::CancellationToken;

use crate::guarded;

/// Inventory entries partitioned by whether the object currently exists.
#[derive(Debug, Clone, Default)]
pub struct Discovered {
    pub live: Vec<(InventoryEntry, LiveResource)>,
    pub missing: Vec<InventoryEntry>,
}

/// One GET per identity, at most `concurrency` in flight, results in input order.
pub(crate) async fn lookup_all(
    cluster: &dyn Cluster,
    ids: &[&ResourceIdentity],
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<Vec<Option<LiveResource>>, ReleaseError> {
    stream::iter(ids.iter().copied())
        .map(|id| async move { guarded(cancel, cluster.get(id)).await?.map_err(ReleaseError::cluster) })
        .buffered(concurrency.max(1))
        .try_collect()
        .await
}

/// Partition inventory entries into live and missing with one targeted GET each.
pub async fn discover_from_inventory(
    cluster: &dyn Cluster,
    entries: &[InventoryEntry],
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<Discovered, ReleaseError> {
    let ids: Vec<&ResourceIdentity> = entries.iter().map(|e| &e.identity).collect();
    let found = lookup_all(cluster, &ids, concurrency, cancel).await?;

    let mut out = Discovered::default();
    for (entry, live) in entries.iter().zip(found) {
        match live {
            Some(l) => out.live.push((entry.clone(), l)),
            None => out.missing.push(entry.clone()),
        }
    }
    Ok(out)
}
