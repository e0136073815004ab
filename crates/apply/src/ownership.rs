//! Release ownership labels on applied objects.

use keel_core::{labels, LiveResource, RenderedResource};
use serde_json::{Map, Value as Json};

/// Copy of `resource` whose content carries the release ownership labels.
pub fn with_release_labels(resource: &RenderedResource, release_name: &str, release_namespace: &str) -> RenderedResource {
    let mut out = resource.clone();
    if let Some(obj) = out.content.as_object_mut() {
        let meta = obj.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
        if let Some(meta) = meta.as_object_mut() {
            let lbls = meta.entry("labels").or_insert_with(|| Json::Object(Map::new()));
            if !lbls.is_object() {
                *lbls = Json::Object(Map::new());
            }
            if let Some(l) = lbls.as_object_mut() {
                l.insert(labels::MANAGED_BY.into(), Json::String(labels::MANAGER.into()));
                l.insert(labels::RELEASE_NAME.into(), Json::String(release_name.into()));
                l.insert(labels::RELEASE_NAMESPACE.into(), Json::String(release_namespace.into()));
                if !resource.component.is_empty() {
                    l.insert(labels::COMPONENT.into(), Json::String(resource.component.clone()));
                }
            }
        }
    }
    out
}

/// `(name, namespace)` of the release a live object is labelled with, if any.
pub fn owner_of(live: &LiveResource) -> Option<(String, String)> {
    let name = live.label(labels::RELEASE_NAME)?;
    let namespace = live.label(labels::RELEASE_NAMESPACE).unwrap_or_default();
    Some((name.to_string(), namespace.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ResourceIdentity;
    use serde_json::json;

    #[test]
    fn labels_are_merged_into_existing_metadata() {
        let r = RenderedResource {
            identity: ResourceIdentity::new("", "v1", "ConfigMap", "prod", "cfg"),
            component: "app".into(),
            weight: 0,
            content: json!({ "metadata": { "name": "cfg", "labels": { "tier": "web" } } }),
        };
        let out = with_release_labels(&r, "web", "prod");
        let l = &out.content["metadata"]["labels"];
        assert_eq!(l["tier"], "web");
        assert_eq!(l[labels::MANAGED_BY], "keel");
        assert_eq!(l[labels::RELEASE_NAME], "web");
        assert_eq!(l[labels::RELEASE_NAMESPACE], "prod");
        assert_eq!(l[labels::COMPONENT], "app");
        assert!(r.content["metadata"]["labels"].get(labels::RELEASE_NAME).is_none());
    }
}
