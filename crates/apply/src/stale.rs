//! Previous-versus-current set difference with rename filtering.

use keel_core::InventoryEntry;

/// `previous - current` under full-identity equality.
pub fn compute_stale_set(previous: &[InventoryEntry], current: &[InventoryEntry]) -> Vec<InventoryEntry> {
    previous
        .iter()
        .filter(|p| !current.iter().any(|c| c.full_identity_eq(p)))
        .cloned()
        .collect()
}

/// Drop candidates that still exist in `current` under another component: a component
/// rename, not a removal. Matching ignores the API version as well, since the API server
/// resolves every served version of a group/kind to the same object.
pub fn apply_rename_safety_check(stale: Vec<InventoryEntry>, current: &[InventoryEntry]) -> Vec<InventoryEntry> {
    stale
        .into_iter()
        .filter(|s| !current.iter().any(|c| c.cluster_identity_eq(s) || c.identity.same_object(&s.identity)))
        .collect()
}

/// Stale entries that are safe to prune.
pub fn prune_candidates(previous: &[InventoryEntry], current: &[InventoryEntry]) -> Vec<InventoryEntry> {
    apply_rename_safety_check(compute_stale_set(previous, current), current)
}
