//! Keel renderer: a module is a directory of YAML (or JSON) manifests. `${dotted.path}`
//! placeholders are replaced from the user values before parsing; `$${` escapes a literal `${`.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use keel_core::{labels, ModuleRef, RenderedResource, Renderer, ResourceIdentity};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

/// Annotation overriding the apply-order weight of a manifest.
pub const WEIGHT_ANNOTATION: &str = "keel.dev/weight";

/// Annotation declaring a manifest `cluster` or `namespaced` scoped.
pub const SCOPE_ANNOTATION: &str = "keel.dev/scope";

fn max_yaml_bytes() -> usize {
    std::env::var("KEEL_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("KEEL_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Built-in kinds that never carry a namespace. The renderer does not talk to the API server,
/// so cluster-scoped custom kinds must say so with [`SCOPE_ANNOTATION`]; otherwise they get
/// the release namespace and the apply is rejected by the server.
const CLUSTER_SCOPED: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "PersistentVolume",
    "StorageClass",
    "PriorityClass",
    "IngressClass",
    "APIService",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
];

/// Default apply-order weight: prerequisites first, admission webhooks last.
pub fn default_weight(kind: &str) -> i32 {
    match kind {
        "Namespace" => -100,
        "CustomResourceDefinition" => -90,
        "ServiceAccount" | "ClusterRole" | "Role" => -50,
        "ClusterRoleBinding" | "RoleBinding" => -40,
        "ConfigMap" | "Secret" | "PersistentVolumeClaim" => -20,
        "Service" => -10,
        "MutatingWebhookConfiguration" | "ValidatingWebhookConfiguration" => 10,
        _ => 0,
    }
}

/// Read a values file (YAML or JSON). A missing path yields an empty object.
pub fn load_values(path: Option<&Path>) -> Result<Json> {
    let Some(path) = path else { return Ok(Json::Object(Default::default())) };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading values file {}", path.display()))?;
    let val: serde_yaml::Value = serde_yaml::from_str(&text).context("parsing values YAML")?;
    let json = serde_json::to_value(val).context("converting values to JSON")?;
    match json {
        Json::Null => Ok(Json::Object(Default::default())),
        Json::Object(_) => Ok(json),
        _ => Err(anyhow!("values file {} must contain a mapping", path.display())),
    }
}

/// Renders a directory of manifests for one release.
pub struct ManifestDirRenderer {
    release_namespace: String,
}

impl ManifestDirRenderer {
    pub fn new(release_namespace: &str) -> Self {
        Self { release_namespace: release_namespace.to_string() }
    }

    pub fn render_dir(&self, root: &Path, values: &Json) -> Result<Vec<RenderedResource>> {
        let mut files = Vec::new();
        collect_manifest_files(root, &mut files).with_context(|| format!("reading module directory {}", root.display()))?;
        files.sort();
        let mut out = Vec::new();
        for file in files {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let text = substitute(&raw, values).with_context(|| format!("substituting values in {}", file.display()))?;
            let component = component_for(root, &file);
            for doc in serde_yaml::Deserializer::from_str(&text) {
                let val = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing YAML in {}", file.display()))?;
                if val.is_null() {
                    continue;
                }
                let r = self
                    .parse_manifest(val, &component)
                    .with_context(|| format!("invalid manifest in {}", file.display()))?;
                out.push(r);
            }
        }
        debug!(module = %root.display(), count = out.len(), "rendered manifests");
        Ok(out)
    }

    fn parse_manifest(&self, val: serde_yaml::Value, component: &str) -> Result<RenderedResource> {
        let mut json = serde_json::to_value(val).context("converting YAML to JSON")?;
        if json.to_string().len() > max_yaml_bytes() {
            return Err(anyhow!("manifest too large (>{} bytes)", max_yaml_bytes()));
        }
        if json_node_budget_exceeded(&json, max_yaml_nodes()) {
            return Err(anyhow!("manifest too complex (>{} nodes)", max_yaml_nodes()));
        }
        let api_version = json.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("manifest missing apiVersion"))?.to_string();
        let kind = json.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("manifest missing kind"))?.to_string();
        let meta = json.get("metadata");
        let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).ok_or_else(|| anyhow!("manifest missing metadata.name"))?.to_string();
        let annotations = meta.and_then(|m| m.get("annotations"));
        let cluster_scoped = match annotations.and_then(|a| a.get(SCOPE_ANNOTATION)).and_then(|v| v.as_str()) {
            Some(s) => match s.trim() {
                "cluster" => true,
                "namespaced" => false,
                other => return Err(anyhow!("{} annotation must be cluster or namespaced, got {:?}", SCOPE_ANNOTATION, other)),
            },
            None => CLUSTER_SCOPED.contains(&kind.as_str()),
        };
        let namespace = if cluster_scoped {
            String::new()
        } else {
            meta.and_then(|m| m.get("namespace"))
                .and_then(|v| v.as_str())
                .unwrap_or(&self.release_namespace)
                .to_string()
        };
        let weight = match annotations.and_then(|a| a.get(WEIGHT_ANNOTATION)).and_then(|v| v.as_str()) {
            Some(w) => w.trim().parse::<i32>().with_context(|| format!("{} annotation must be an integer", WEIGHT_ANNOTATION))?,
            None => default_weight(&kind),
        };
        let component = meta
            .and_then(|m| m.get("labels"))
            .and_then(|l| l.get(labels::COMPONENT))
            .and_then(|v| v.as_str())
            .unwrap_or(component)
            .to_string();
        ensure_metadata(&mut json, &name, &namespace)?;
        Ok(RenderedResource {
            identity: ResourceIdentity::from_api_version(&api_version, &kind, &namespace, &name),
            component,
            weight,
            content: json,
        })
    }
}

#[async_trait::async_trait]
impl Renderer for ManifestDirRenderer {
    async fn render(&self, module: &ModuleRef, values: &Json) -> Result<Vec<RenderedResource>> {
        self.render_dir(&PathBuf::from(&module.path), values)
    }
}

fn collect_manifest_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_manifest_files(&path, out)?;
        } else if matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml" | "json")) {
            out.push(path);
        }
    }
    Ok(())
}

/// First directory under the module root, or the file stem for top-level files.
fn component_for(root: &Path, file: &Path) -> String {
    let rel = file.strip_prefix(root).unwrap_or(file);
    let mut parts = rel.components();
    match (parts.next(), parts.next()) {
        (Some(dir), Some(_)) => dir.as_os_str().to_string_lossy().to_string(),
        _ => file.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default(),
    }
}

fn ensure_metadata(v: &mut Json, name: &str, ns: &str) -> Result<()> {
    let obj = v.as_object_mut().ok_or_else(|| anyhow!("manifest must be a mapping"))?;
    let meta = obj.entry("metadata").or_insert(Json::Object(serde_json::Map::new()));
    if let Some(m) = meta.as_object_mut() {
        m.insert("name".into(), Json::String(name.to_string()));
        if ns.is_empty() {
            m.remove("namespace");
        } else {
            m.insert("namespace".into(), Json::String(ns.to_string()));
        }
    }
    Ok(())
}

fn lookup<'a>(values: &'a Json, path: &str) -> Option<&'a Json> {
    path.split('.').try_fold(values, |cur, seg| cur.get(seg))
}

/// Replace `${dotted.path}` placeholders with values. Scalars render bare; mappings and
/// sequences render as JSON flow, which is valid YAML.
fn substitute(text: &str, values: &Json) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if let Some(after) = tail.strip_prefix("$${") {
            out.push_str("${");
            rest = after;
        } else if let Some(after) = tail.strip_prefix("${") {
            let end = after.find('}').ok_or_else(|| anyhow!("unterminated placeholder"))?;
            let key = after[..end].trim();
            let val = lookup(values, key).ok_or_else(|| anyhow!("undefined value ${{{}}}", key))?;
            match val {
                Json::String(s) => out.push_str(s),
                Json::Null => out.push_str("null"),
                other => out.push_str(&other.to_string()),
            }
            rest = &after[end + 1..];
        } else {
            out.push('$');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    Ok(out)
}
