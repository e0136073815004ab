//! Keel apply: reconcile a rendered release against the cluster and its inventory.
//!
//! Operations are ordered sequences of blocking calls. Each collaborator call is raced against
//! the caller's cancellation token; nothing is pruned and no inventory is written unless the
//! full desired set was applied.

#![forbid(unsafe_code)]

use std::future::Future;

use keel_core::ReleaseError;
use keel_persist::StoreError;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod discovery;
pub mod drift;
pub mod ownership;
pub mod prune;
pub mod release;
pub mod safety;
pub mod stale;

pub use config::ReleaseConfig;
pub use discovery::{discover_from_inventory, Discovered};
pub use drift::{drift_summary, DriftSummary};
pub use prune::{prune_stale_resources, PruneReport};
pub use release::{
    ApplyOutcome, ApplyRequest, DeleteOutcome, DiffReport, ModifiedResource, ReleaseEngine, ReleaseSelector,
    ReleaseStatus, ResourceState, ResourceStatus,
};
pub use safety::pre_apply_existence_check;
pub use stale::{apply_rename_safety_check, compute_stale_set, prune_candidates};

/// Await `fut` unless `cancel` fires first.
pub(crate) async fn guarded<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, ReleaseError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ReleaseError::Cancelled),
        out = fut => Ok(out),
    }
}

pub(crate) fn store_error(err: StoreError) -> ReleaseError {
    match err {
        StoreError::Conflict { name, namespace } => ReleaseError::InventoryConflict { name, namespace },
        other => ReleaseError::Inventory(Box::new(other)),
    }
}
