//! Change identification and bounded history.

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::inventory::{ChangeEntry, ChangeSource, Inventory, InventoryEntry};

/// Deterministic id of one reconciliation outcome.
///
/// Unpublished modules pass `None` as version; the id is then stable per values and digest.
pub fn compute_change_id(
    module_path: &str,
    module_version: Option<&str>,
    values_fingerprint: &str,
    manifest_digest: &str,
) -> String {
    let mut hasher = Sha256::new();
    for part in [module_path, module_version.unwrap_or(""), values_fingerprint, manifest_digest] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Move `change_id` to the head of the index, inserting it if absent.
pub fn update_index(mut index: Vec<String>, change_id: &str) -> Vec<String> {
    index.retain(|id| id != change_id);
    index.insert(0, change_id.to_string());
    index
}

/// Truncate history and index to `max_history`, discarding the oldest. Zero is treated as one:
/// the current change is never dropped.
pub fn prune_history(inventory: &mut Inventory, max_history: usize) {
    let keep = max_history.max(1);
    inventory.history.truncate(keep);
    inventory.index.truncate(keep);
}

/// Bundle a new change entry, id included, ready to be recorded.
pub fn prepare_change(source: ChangeSource, manifest_digest: String, entries: Vec<InventoryEntry>) -> ChangeEntry {
    let change_id = compute_change_id(
        &source.module.path,
        source.module.version.as_deref(),
        &source.values_digest,
        &manifest_digest,
    );
    ChangeEntry { change_id, timestamp: Utc::now(), digest: manifest_digest, source, entries }
}
