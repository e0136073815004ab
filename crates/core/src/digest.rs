//! Canonical ordering and hashing of resource sets.

use std::cmp::Ordering;

use serde_json::Value as Json;
use sha2::{Digest, Sha256};

use crate::identity::RenderedResource;

const DIGEST_PREFIX: &str = "sha256:";

/// Total apply order: the 5-key sort key, then version, component and canonical content
/// so that two distinct resources never compare equal.
pub fn apply_order(a: &RenderedResource, b: &RenderedResource) -> Ordering {
    a.sort_key()
        .cmp(&b.sort_key())
        .then_with(|| a.identity.version.cmp(&b.identity.version))
        .then_with(|| a.component.cmp(&b.component))
        .then_with(|| canonical_bytes(&normalize(&a.content)).cmp(&canonical_bytes(&normalize(&b.content))))
}

/// Sort in place into apply order (stable).
pub fn sort_resources(resources: &mut [RenderedResource]) {
    resources.sort_by(apply_order);
}

/// Order-independent SHA-256 digest of a resource set.
pub fn compute_manifest_digest(resources: &[RenderedResource]) -> String {
    let mut ordered: Vec<&RenderedResource> = resources.iter().collect();
    ordered.sort_by(|a, b| apply_order(a, b));

    let mut hasher = Sha256::new();
    hasher.update((ordered.len() as u64).to_be_bytes());
    for r in ordered {
        for field in [
            r.identity.group.as_str(),
            r.identity.version.as_str(),
            r.identity.kind.as_str(),
            r.identity.namespace.as_str(),
            r.identity.name.as_str(),
            r.component.as_str(),
        ] {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(r.weight.to_be_bytes());
        let body = canonical_bytes(&normalize(&r.content));
        hasher.update((body.len() as u64).to_be_bytes());
        hasher.update(&body);
    }
    format!("{}{:x}", DIGEST_PREFIX, hasher.finalize())
}

/// Fingerprint of a single resource's normalized content.
pub fn content_checksum(content: &Json) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_bytes(&normalize(content)));
    format!("{}{:x}", DIGEST_PREFIX, hasher.finalize())
}

/// Fingerprint of the user-supplied values that fed a render.
pub fn values_fingerprint(values: &Json) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_bytes(values));
    format!("{}{:x}", DIGEST_PREFIX, hasher.finalize())
}

/// Drop server-populated fields that never belong to the desired state.
pub fn normalize(content: &Json) -> Json {
    let mut v = content.clone();
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
        meta.remove("selfLink");
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Compact JSON with object keys sorted at every level, independent of map ordering features.
pub fn canonical_bytes(v: &Json) -> Vec<u8> {
    fn write(v: &Json, out: &mut Vec<u8>) {
        match v {
            Json::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push(b'{');
                for (i, k) in keys.into_iter().enumerate() {
                    if i > 0 {
                        out.push(b',');
                    }
                    out.extend_from_slice(Json::String(k.clone()).to_string().as_bytes());
                    out.push(b':');
                    if let Some(child) = map.get(k.as_str()) {
                        write(child, out);
                    }
                }
                out.push(b'}');
            }
            Json::Array(items) => {
                out.push(b'[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(b',');
                    }
                    write(item, out);
                }
                out.push(b']');
            }
            scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
        }
    }
    let mut out = Vec::new();
    write(v, &mut out);
    out
}
