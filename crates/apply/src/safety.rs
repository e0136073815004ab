//! Pre-apply existence checks.

use keel_core::{Cluster, PreApplyViolation, ReleaseError, RenderedResource, ResourceIdentity, ViolationKind};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{discovery::lookup_all, ownership::owner_of};

/// Targeted GET for every resource about to be applied.
///
/// Fails when a live object is terminating, or is labelled as owned by another release and
/// `force` is off. Returns live objects with no ownership labels, which the apply adopts.
pub async fn pre_apply_existence_check(
    cluster: &dyn Cluster,
    resources: &[RenderedResource],
    release_name: &str,
    release_namespace: &str,
    force: bool,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<Vec<ResourceIdentity>, ReleaseError> {
    let ids: Vec<&ResourceIdentity> = resources.iter().map(|r| &r.identity).collect();
    let found = lookup_all(cluster, &ids, concurrency, cancel).await?;

    let mut violations = Vec::new();
    let mut adopted = Vec::new();
    for (id, live) in ids.into_iter().zip(found) {
        let Some(live) = live else { continue };
        if live.terminating {
            violations.push(PreApplyViolation { identity: id.clone(), kind: ViolationKind::Terminating, owner: None });
            continue;
        }
        match owner_of(&live) {
            Some((name, ns)) if name == release_name && ns == release_namespace => {}
            Some((name, ns)) if !force => violations.push(PreApplyViolation {
                identity: id.clone(),
                kind: ViolationKind::OwnedByOtherRelease,
                owner: Some(format!("{}/{}", ns, name)),
            }),
            Some(_) => {
                debug!(resource = %id, "taking over resource owned by another release");
                adopted.push(id.clone());
            }
            None => adopted.push(id.clone()),
        }
    }
    if violations.is_empty() {
        Ok(adopted)
    } else {
        Err(ReleaseError::PreApplyConflict { violations })
    }
}
