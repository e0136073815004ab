//! Field-level drift between desired and live content.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriftSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DriftSummary {
    pub fn is_empty(&self) -> bool {
        self.adds == 0 && self.updates == 0 && self.removes == 0
    }
}

/// Count what applying `desired` would change in `live`.
///
/// Only fields present in `desired` are compared: live-only object keys are server defaults or
/// other field managers and are not drift. Arrays compare element-wise.
pub fn drift_summary(desired: &Json, live: &Json) -> DriftSummary {
    fn walk(a: &Json, b: &Json, s: &mut DriftSummary) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
            }
            (V::Array(aa), V::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len {
                    if aa[i] != bb[i] {
                        walk(&aa[i], &bb[i], s);
                    }
                }
                if aa.len() > bb.len() { s.adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { s.removes += bb.len() - aa.len(); }
            }
            (av, bv) => {
                if av != bv { s.updates += 1; }
            }
        }
    }
    let mut s = DriftSummary::default();
    walk(desired, live, &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counts_adds_updates_removes() {
        let live = json!({
            "a": 1,
            "b": { "x": 1 },
            "c": [1, 2, 3]
        });
        let desired = json!({
            "a": 2,
            "b": { "x": 1, "y": 2 },
            "c": [1, 9],
            "d": true
        });
        let s = drift_summary(&desired, &live);
        assert_eq!(s, DriftSummary { adds: 2, updates: 2, removes: 1 });
    }

    #[test]
    fn server_defaulted_fields_are_not_drift() {
        let desired = json!({ "spec": { "replicas": 2, "template": { "spec": { "containers": [ { "name": "web", "image": "nginx" } ] } } } });
        let live = json!({
            "spec": {
                "replicas": 2,
                "progressDeadlineSeconds": 600,
                "template": { "spec": { "containers": [ { "name": "web", "image": "nginx", "imagePullPolicy": "Always" } ] } }
            },
            "status": { "readyReplicas": 2 }
        });
        assert!(drift_summary(&desired, &live).is_empty());
    }
}
