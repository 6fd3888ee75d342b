//! Overlay composition: base manifests plus targeted patches.
//!
//! Composition reads resources through the [`FileSet`] abstraction so the
//! in-memory file set used by the patch pipeline can be swapped without
//! touching rendering.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::core::manifest::{ManifestSet, aggregate};
use crate::core::patch::PatchSet;
use crate::error::{Error, Result};

/// Minimal file store feeding the composer.
pub trait FileSet {
    fn write(&mut self, name: &str, data: Vec<u8>);
    /// File names in sorted order.
    fn list(&self) -> Vec<String>;
    fn read(&self, name: &str) -> Option<&[u8]>;
}

/// Process-local file set, discarded with the invocation.
#[derive(Debug, Clone, Default)]
pub struct MemoryFileSet {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryFileSet {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileSet for MemoryFileSet {
    fn write(&mut self, name: &str, data: Vec<u8>) {
        self.files.insert(name.to_string(), data);
    }

    fn list(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    fn read(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(Vec::as_slice)
    }
}

/// Combines named resources and rendered patches into final YAML.
pub trait Composer {
    fn compose(&self, files: &dyn FileSet, resources: &[String], patches: &PatchSet)
    -> Result<String>;
}

/// Merge-patch based composer.
///
/// Resources are loaded in sorted name order; patches are applied in
/// declaration order to every document their selector matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlayComposer;

impl Composer for OverlayComposer {
    fn compose(
        &self,
        files: &dyn FileSet,
        resources: &[String],
        patches: &PatchSet,
    ) -> Result<String> {
        let mut names = resources.to_vec();
        names.sort();
        names.dedup();

        let mut manifests = aggregate(files, &names)?;
        apply_patches(&mut manifests, patches)?;
        manifests.to_yaml()
    }
}

/// Apply every patch to the documents its selector addresses.
pub fn apply_patches(manifests: &mut ManifestSet, patches: &PatchSet) -> Result<()> {
    for patch in patches.iter() {
        let body: Value = serde_json::from_str(&patch.body).map_err(|err| Error::MalformedPatch {
            key: patch.key.clone(),
            message: err.to_string(),
        })?;

        let mut applied = 0usize;
        for doc in manifests.documents_mut() {
            if patch.target.matches(doc) {
                merge_patch(&mut doc.value, &body);
                applied += 1;
            }
        }

        if applied == 0 {
            warn!(
                key = %patch.key,
                kind = %patch.target.kind,
                name = %patch.target.name,
                namespace = %patch.target.namespace,
                "patch target not found in resources"
            );
        } else {
            debug!(key = %patch.key, applied, "applied patch");
        }
    }
    Ok(())
}

/// Merge `patch` into `target`.
///
/// Objects merge recursively and `null` removes a field. Lists whose elements
/// are all objects with a `name` merge element-wise by name; any other list
/// is replaced.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => merge_objects(target, patch),
        (Value::Array(target), Value::Array(patch))
            if keyed_by_name(target) && keyed_by_name(patch) =>
        {
            for item in patch {
                let name = item.get("name");
                match target.iter_mut().find(|existing| existing.get("name") == name) {
                    Some(existing) => merge_patch(existing, item),
                    None => target.push(without_nulls(item)),
                }
            }
        }
        (target, patch) => *target = without_nulls(patch),
    }
}

fn merge_objects(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        if value.is_null() {
            target.remove(key);
            continue;
        }
        match target.get_mut(key) {
            Some(existing) => merge_patch(existing, value),
            None => {
                target.insert(key.clone(), without_nulls(value));
            }
        }
    }
}

fn keyed_by_name(items: &[Value]) -> bool {
    items
        .iter()
        .all(|item| item.get("name").and_then(Value::as_str).is_some_and(|n| !n.is_empty()))
}

fn without_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), without_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(without_nulls).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::experiment::{PatchTemplate, TargetRef};
    use crate::core::patch::PatchRenderer;
    use crate::core::trial::Trial;
    use serde_json::json;

    const DEPLOYMENT: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 1
  template:
    spec:
      containers:
        - name: app
          image: shop:1.0
          resources:
            limits:
              cpu: 100m
        - name: sidecar
          image: proxy:2
";

    fn patches(body: &str, kind: &str, name: &str, namespace: &str) -> PatchSet {
        let trial = Trial {
            name: "exp-001".to_string(),
            namespace: "default".to_string(),
            number: 1,
            assignments: [("replicas".to_string(), json!(3))].into_iter().collect(),
        };
        PatchRenderer::new()
            .render_all(
                &[PatchTemplate {
                    patch: body.to_string(),
                    target_ref: TargetRef {
                        api_version: "apps/v1".to_string(),
                        kind: kind.to_string(),
                        name: name.to_string(),
                        namespace: namespace.to_string(),
                        ..TargetRef::default()
                    },
                    ..PatchTemplate::default()
                }],
                &trial,
            )
            .expect("render")
    }

    fn files() -> MemoryFileSet {
        let mut files = MemoryFileSet::new();
        files.write("web.yaml", DEPLOYMENT.as_bytes().to_vec());
        files.write(
            "config.yaml",
            b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: web\n".to_vec(),
        );
        files
    }

    #[test]
    fn overwrites_replicas_on_matching_deployment() {
        let set = patches(
            r#"{"spec":{"replicas":"{{ .Parameters.replicas }}"}}"#,
            "Deployment",
            "web",
            "default",
        );
        let yaml = OverlayComposer
            .compose(&files(), &["web.yaml".to_string(), "config.yaml".to_string()], &set)
            .expect("compose");

        let out = ManifestSet::from_bytes("out", yaml.as_bytes()).expect("parse output");
        assert_eq!(out.documents().len(), 2);
        let deployment = out
            .documents()
            .iter()
            .find(|doc| doc.kind.as_str() == "Deployment")
            .expect("deployment");
        assert_eq!(deployment.value["spec"]["replicas"], json!(3));
        let config = out
            .documents()
            .iter()
            .find(|doc| doc.kind.as_str() == "ConfigMap")
            .expect("config map");
        assert!(config.value.get("spec").is_none());
    }

    #[test]
    fn merges_containers_by_name() {
        let set = patches(
            r#"{"spec":{"template":{"spec":{"containers":[{"name":"app","resources":{"limits":{"cpu":"500m"}}}]}}}}"#,
            "Deployment",
            "web",
            "",
        );
        let mut manifests = ManifestSet::from_bytes("web.yaml", DEPLOYMENT.as_bytes()).expect("parse");
        apply_patches(&mut manifests, &set).expect("apply");

        let containers = &manifests.documents()[0].value["spec"]["template"]["spec"]["containers"];
        assert_eq!(containers.as_array().map(Vec::len), Some(2));
        assert_eq!(containers[0]["resources"]["limits"]["cpu"], json!("500m"));
        assert_eq!(containers[0]["image"], json!("shop:1.0"));
        assert_eq!(containers[1]["name"], json!("sidecar"));
    }

    #[test]
    fn unmatched_patch_leaves_resources_untouched() {
        let set = patches(r#"{"spec":{"replicas":9}}"#, "Deployment", "other", "");
        let mut manifests = ManifestSet::from_bytes("web.yaml", DEPLOYMENT.as_bytes()).expect("parse");
        let before = manifests.clone();
        apply_patches(&mut manifests, &set).expect("apply");
        assert_eq!(manifests, before);
    }

    #[test]
    fn missing_resource_is_input_error() {
        let err = OverlayComposer
            .compose(&files(), &["absent.yaml".to_string()], &PatchSet::default())
            .expect_err("missing file");
        assert!(matches!(err, Error::Input { .. }));
    }

    #[test]
    fn null_removes_fields_and_scalars_replace() {
        let mut target = json!({"a": 1, "b": {"c": 2, "d": 3}, "list": [1, 2]});
        merge_patch(&mut target, &json!({"a": null, "b": {"c": 5}, "list": [3]}));
        assert_eq!(target, json!({"b": {"c": 5, "d": 3}, "list": [3]}));
    }

    #[test]
    fn memory_file_set_lists_sorted_names() {
        let files = files();
        assert_eq!(files.list(), vec!["config.yaml".to_string(), "web.yaml".to_string()]);
        assert!(files.read("web.yaml").is_some());
        assert!(files.read("nope.yaml").is_none());
    }
}
