use serde::{Deserialize, Serialize};

/// Process-wide release settings, threaded explicitly into every operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseConfig {
    /// Change entries kept in the inventory (minimum 1).
    pub max_history: usize,
    /// Delete stale resources after a successful apply.
    pub prune: bool,
    /// Allow pruning and release deletion to remove Namespace objects.
    pub prune_namespaces: bool,
    /// Accept an empty render over a non-empty inventory.
    pub allow_empty: bool,
    /// Take over resources labelled as owned by another release.
    pub force: bool,
    /// Server-side apply field manager.
    pub field_manager: String,
    /// In-flight targeted lookups during checks and discovery.
    pub lookup_concurrency: usize,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            max_history: 10,
            prune: true,
            prune_namespaces: false,
            allow_empty: false,
            force: false,
            field_manager: "keel".to_string(),
            lookup_concurrency: 8,
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|s| s.parse::<usize>().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

impl ReleaseConfig {
    /// Defaults overridden by `KEEL_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_history: env_usize("KEEL_MAX_HISTORY").unwrap_or(d.max_history).max(1),
            prune: env_bool("KEEL_PRUNE").unwrap_or(d.prune),
            prune_namespaces: env_bool("KEEL_PRUNE_NAMESPACES").unwrap_or(d.prune_namespaces),
            allow_empty: d.allow_empty,
            force: d.force,
            field_manager: std::env::var("KEEL_FIELD_MANAGER").unwrap_or(d.field_manager),
            lookup_concurrency: env_usize("KEEL_LOOKUP_CONCURRENCY").unwrap_or(d.lookup_concurrency).max(1),
        }
    }
}
