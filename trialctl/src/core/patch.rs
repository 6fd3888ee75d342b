//! Patch template rendering.
//!
//! Each [`PatchTemplate`] renders to a JSON object scoped to exactly one
//! target. The rendered target reference always overwrites `apiVersion`,
//! `kind`, `metadata.name`, and `metadata.namespace` in the body, so a patch
//! cannot redirect itself to another object.

use std::sync::LazyLock;

use minijinja::{Environment, UndefinedBehavior, context};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::experiment::{PatchTemplate, TargetRef, split_api_version};
use crate::core::manifest::Document;
use crate::core::trial::Trial;
use crate::error::{Error, Result};

/// Target of a rendered patch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Selector {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl Selector {
    pub fn from_target(target: &TargetRef) -> Self {
        let (group, version) = target.group_version();
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: target.kind.clone(),
            name: target.name.clone(),
            namespace: target.namespace.clone(),
        }
    }

    /// Whether `doc` is addressed by this selector. Empty fields match anything;
    /// a document without a namespace lives in `default`.
    pub fn matches(&self, doc: &Document) -> bool {
        let (group, version) = split_api_version(doc.api_version());
        let namespace = doc.namespace().unwrap_or("default");
        field_matches(&self.group, group)
            && field_matches(&self.version, version)
            && field_matches(&self.kind, doc.kind.as_str())
            && field_matches(&self.name, doc.name())
            && field_matches(&self.namespace, namespace)
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

fn field_matches(want: &str, have: &str) -> bool {
    want.is_empty() || want == have
}

/// A rendered JSON patch and the object it applies to.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPatch {
    /// Generated identifier, `patch-<index>`.
    pub key: String,
    /// Serialized JSON object.
    pub body: String,
    pub target: Selector,
}

/// Rendered patches in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchSet {
    patches: Vec<RenderedPatch>,
}

impl PatchSet {
    pub fn iter(&self) -> impl Iterator<Item = &RenderedPatch> {
        self.patches.iter()
    }

    pub fn get(&self, key: &str) -> Option<&RenderedPatch> {
        self.patches.iter().find(|patch| patch.key == key)
    }

    pub fn keys(&self) -> Vec<&str> {
        self.patches.iter().map(|patch| patch.key.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

/// Trial fields exposed to templates as `Trial`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct TrialContext<'a> {
    name: &'a str,
    namespace: &'a str,
    number: u64,
}

/// Template engine wrapper around minijinja.
pub struct PatchRenderer {
    env: Environment<'static>,
}

impl Default for PatchRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PatchRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self { env }
    }

    /// Render every template against `trial`, keyed `patch-0`, `patch-1`, ...
    pub fn render_all(&self, templates: &[PatchTemplate], trial: &Trial) -> Result<PatchSet> {
        let ctx = context! {
            Parameters => &trial.assignments,
            Values => &trial.assignments,
            Trial => TrialContext {
                name: &trial.name,
                namespace: &trial.namespace,
                number: trial.number,
            },
        };

        let patches = templates
            .iter()
            .enumerate()
            .map(|(index, template)| self.render_one(index, template, &ctx))
            .collect::<Result<Vec<_>>>()?;
        Ok(PatchSet { patches })
    }

    fn render_one(
        &self,
        index: usize,
        template: &PatchTemplate,
        ctx: &minijinja::Value,
    ) -> Result<RenderedPatch> {
        let key = format!("patch-{index}");
        let target = self.render_target(&key, &template.target_ref, ctx)?;
        let mut body = self.render_body(&key, &template.patch, ctx)?;
        apply_target_metadata(&mut body, &target);

        let body = Value::Object(body).to_string();
        debug!(key = %key, kind = %target.kind, name = %target.name, "rendered patch");
        Ok(RenderedPatch {
            key,
            body,
            target: Selector::from_target(&target),
        })
    }

    fn render_target(
        &self,
        key: &str,
        target: &TargetRef,
        ctx: &minijinja::Value,
    ) -> Result<TargetRef> {
        let rendered = TargetRef {
            api_version: self.render_str(key, &target.api_version, ctx)?,
            kind: self.render_str(key, &target.kind, ctx)?,
            name: self.render_str(key, &target.name, ctx)?,
            namespace: self.render_str(key, &target.namespace, ctx)?,
            other: target.other.clone(),
        };
        if rendered.kind.trim().is_empty() {
            return Err(Error::EmptyTarget {
                key: key.to_string(),
                field: "kind",
            });
        }
        if rendered.name.trim().is_empty() {
            return Err(Error::EmptyTarget {
                key: key.to_string(),
                field: "name",
            });
        }
        Ok(rendered)
    }

    /// Render the body to a JSON object.
    ///
    /// A body that is already JSON is rendered leaf by leaf so that a string
    /// holding a single expression can become a number or boolean. Anything
    /// else is rendered as text first and parsed afterwards.
    fn render_body(
        &self,
        key: &str,
        text: &str,
        ctx: &minijinja::Value,
    ) -> Result<Map<String, Value>> {
        let rendered = match serde_json::from_str::<Value>(text) {
            Ok(skeleton) => self.render_value(key, skeleton, ctx)?,
            Err(_) => {
                let output = self.render_str(key, text, ctx)?;
                serde_json::from_str(&output).map_err(|err| Error::MalformedPatch {
                    key: key.to_string(),
                    message: err.to_string(),
                })?
            }
        };
        match rendered {
            Value::Object(map) => Ok(map),
            other => Err(Error::MalformedPatch {
                key: key.to_string(),
                message: format!("expected a JSON object, got {}", json_type(&other)),
            }),
        }
    }

    fn render_value(&self, key: &str, value: Value, ctx: &minijinja::Value) -> Result<Value> {
        match value {
            Value::String(text) if text.contains("{{") => {
                if let Some(expr) = single_expression(&text)
                    && let typed @ (Value::Number(_) | Value::Bool(_)) =
                        self.eval_expression(key, &expr, ctx)?
                {
                    return Ok(typed);
                }
                self.render_str(key, &text, ctx).map(Value::String)
            }
            Value::Array(items) => items
                .into_iter()
                .map(|item| self.render_value(key, item, ctx))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::new();
                for (field, item) in map {
                    let field = if field.contains("{{") {
                        self.render_str(key, &field, ctx)?
                    } else {
                        field
                    };
                    out.insert(field, self.render_value(key, item, ctx)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other),
        }
    }

    /// Evaluate a bare expression and convert the result to JSON, keeping its
    /// type: a string assignment stays a string even if it looks numeric.
    fn eval_expression(&self, key: &str, expr: &str, ctx: &minijinja::Value) -> Result<Value> {
        let render_error = |err: minijinja::Error| Error::Render {
            template: key.to_string(),
            message: format!("{err:#}"),
        };
        let value = self
            .env
            .compile_expression(expr)
            .and_then(|compiled| compiled.eval(ctx))
            .map_err(render_error)?;
        if value.is_undefined() {
            return Ok(Value::Null);
        }
        serde_json::to_value(&value).map_err(|err| Error::Render {
            template: key.to_string(),
            message: err.to_string(),
        })
    }

    fn render_str(&self, key: &str, text: &str, ctx: &minijinja::Value) -> Result<String> {
        if !text.contains("{{") && !text.contains("{%") {
            return Ok(text.to_string());
        }
        self.env
            .render_str(&normalize_expressions(text), ctx)
            .map_err(|err| Error::Render {
                template: key.to_string(),
                message: format!("{err:#}"),
            })
    }
}

/// Overwrite identifying metadata with the rendered target.
fn apply_target_metadata(body: &mut Map<String, Value>, target: &TargetRef) {
    body.insert(
        "apiVersion".to_string(),
        Value::String(target.api_version.clone()),
    );
    body.insert("kind".to_string(), Value::String(target.kind.clone()));

    let metadata = body
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if !metadata.is_object() {
        *metadata = Value::Object(Map::new());
    }
    if let Value::Object(meta) = metadata {
        meta.insert("name".to_string(), Value::String(target.name.clone()));
        if target.namespace.is_empty() {
            meta.remove("namespace");
        } else {
            meta.insert(
                "namespace".to_string(),
                Value::String(target.namespace.clone()),
            );
        }
    }
}

/// Accept Go-style leading-dot field access: `{{ .Parameters.x }}` → `{{ Parameters.x }}`.
fn normalize_expressions(text: &str) -> String {
    static LEADING_DOT: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"\{\{(-?)\s*\.([A-Za-z_])").expect("valid regex"));
    LEADING_DOT.replace_all(text, "{{$1 $2").into_owned()
}

/// The inner expression of a leaf that is exactly one `{{ ... }}` block.
fn single_expression(text: &str) -> Option<String> {
    let normalized = normalize_expressions(text.trim());
    let inner = normalized.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    let inner = inner.strip_prefix('-').unwrap_or(inner);
    let inner = inner.strip_suffix('-').unwrap_or(inner);
    Some(inner.trim().to_string())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn trial(assignments: Value) -> Trial {
        let assignments: BTreeMap<String, Value> =
            serde_json::from_value(assignments).expect("assignments");
        Trial {
            name: "web-tuning-003".to_string(),
            namespace: "default".to_string(),
            number: 3,
            assignments,
        }
    }

    fn template(patch: &str, name: &str, namespace: &str) -> PatchTemplate {
        PatchTemplate {
            patch: patch.to_string(),
            target_ref: TargetRef {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
                ..TargetRef::default()
            },
            ..PatchTemplate::default()
        }
    }

    #[test]
    fn renders_single_expression_as_typed_value() {
        let set = PatchRenderer::new()
            .render_all(
                &[template(
                    r#"{"spec":{"replicas":"{{.Parameters.replicas}}"}}"#,
                    "web",
                    "default",
                )],
                &trial(json!({"replicas": 3})),
            )
            .expect("render");

        let patch = set.get("patch-0").expect("patch-0");
        let body: Value = serde_json::from_str(&patch.body).expect("json");
        assert_eq!(body["spec"], json!({"replicas": 3}));
        assert_eq!(
            patch.target,
            Selector {
                group: "apps".to_string(),
                version: "v1".to_string(),
                kind: "Deployment".to_string(),
                name: "web".to_string(),
                namespace: "default".to_string(),
            }
        );
    }

    #[test]
    fn mixed_text_stays_a_string() {
        let set = PatchRenderer::new()
            .render_all(
                &[template(
                    r#"{"spec":{"cpu":"{{ Parameters.cpu }}m","tier":"{{ .Values.tier }}"}}"#,
                    "web",
                    "",
                )],
                &trial(json!({"cpu": 500, "tier": "gold"})),
            )
            .expect("render");
        let body: Value = serde_json::from_str(&set.get("patch-0").expect("p").body).expect("json");
        assert_eq!(body["spec"]["cpu"], json!("500m"));
        assert_eq!(body["spec"]["tier"], json!("gold"));
    }

    #[test]
    fn string_assignments_keep_their_type() {
        let set = PatchRenderer::new()
            .render_all(
                &[template(
                    r#"{"metadata":{"labels":{"v":"{{ .Parameters.tag }}","f":"{{ .Parameters.flag }}"}},"spec":{"paused":"{{- .Parameters.paused -}}"}}"#,
                    "web",
                    "default",
                )],
                &trial(json!({"tag": "1.10", "flag": "true", "paused": true})),
            )
            .expect("render");
        let body: Value = serde_json::from_str(&set.get("patch-0").expect("p").body).expect("json");
        assert_eq!(body["metadata"]["labels"]["v"], json!("1.10"));
        assert_eq!(body["metadata"]["labels"]["f"], json!("true"));
        assert_eq!(body["spec"]["paused"], json!(true));
    }

    #[test]
    fn renders_non_json_templates_as_text() {
        let set = PatchRenderer::new()
            .render_all(
                &[template(
                    r#"{"spec":{"replicas": {{ .Parameters.replicas }} }}"#,
                    "web",
                    "default",
                )],
                &trial(json!({"replicas": 2})),
            )
            .expect("render");
        let body: Value = serde_json::from_str(&set.get("patch-0").expect("p").body).expect("json");
        assert_eq!(body["spec"]["replicas"], json!(2));
    }

    #[test]
    fn target_metadata_overrides_body() {
        let body = r#"{"apiVersion":"v1","kind":"Secret","metadata":{"name":"evil","namespace":"kube-system","labels":{"a":"b"}},"spec":{}}"#;
        let set = PatchRenderer::new()
            .render_all(
                &[template(body, "{{ Trial.Name }}", "{{ Trial.Namespace }}")],
                &trial(json!({})),
            )
            .expect("render");
        let patch = set.get("patch-0").expect("p");
        let parsed: Value = serde_json::from_str(&patch.body).expect("json");
        assert_eq!(parsed["apiVersion"], json!("apps/v1"));
        assert_eq!(parsed["kind"], json!("Deployment"));
        assert_eq!(parsed["metadata"]["name"], json!("web-tuning-003"));
        assert_eq!(parsed["metadata"]["namespace"], json!("default"));
        assert_eq!(parsed["metadata"]["labels"], json!({"a": "b"}));
        assert_eq!(patch.target.name, "web-tuning-003");
    }

    #[test]
    fn empty_target_namespace_strips_body_namespace() {
        let body = r#"{"metadata":{"namespace":"elsewhere"}}"#;
        let set = PatchRenderer::new()
            .render_all(&[template(body, "web", "")], &trial(json!({})))
            .expect("render");
        let parsed: Value = serde_json::from_str(&set.get("patch-0").expect("p").body).expect("json");
        assert!(parsed["metadata"].get("namespace").is_none());
    }

    #[test]
    fn keys_follow_declaration_order() {
        let templates = vec![
            template(r#"{"a":1}"#, "one", ""),
            template(r#"{"b":2}"#, "two", ""),
            template(r#"{"c":3}"#, "three", ""),
        ];
        let set = PatchRenderer::new()
            .render_all(&templates, &trial(json!({})))
            .expect("render");
        assert_eq!(set.keys(), vec!["patch-0", "patch-1", "patch-2"]);
        let names: Vec<&str> = set.iter().map(|p| p.target.name.as_str()).collect();
        assert_eq!(names, vec!["one", "two", "three"]);
    }

    #[test]
    fn malformed_json_is_rejected() {
        let err = PatchRenderer::new()
            .render_all(
                &[template("{ not json {{ Parameters.x }}", "web", "")],
                &trial(json!({"x": 1})),
            )
            .expect_err("malformed");
        assert!(matches!(err, Error::MalformedPatch { ref key, .. } if key == "patch-0"));
    }

    #[test]
    fn non_object_body_is_rejected() {
        let err = PatchRenderer::new()
            .render_all(&[template("[1, 2]", "web", "")], &trial(json!({})))
            .expect_err("array body");
        assert!(matches!(err, Error::MalformedPatch { .. }));
    }

    #[test]
    fn empty_rendered_name_is_rejected() {
        let err = PatchRenderer::new()
            .render_all(
                &[template(r#"{}"#, "{{ Parameters.target }}", "")],
                &trial(json!({"target": ""})),
            )
            .expect_err("empty name");
        assert!(matches!(err, Error::EmptyTarget { field: "name", .. }));
    }

    #[test]
    fn undefined_parameter_is_render_error() {
        let err = PatchRenderer::new()
            .render_all(
                &[template(r#"{"x":"{{ .Parameters.missing }}"}"#, "web", "")],
                &trial(json!({})),
            )
            .expect_err("undefined");
        assert!(matches!(err, Error::Render { .. }));
    }

    #[test]
    fn selector_round_trips_through_rendered_json() {
        let set = PatchRenderer::new()
            .render_all(&[template(r#"{"spec":{}}"#, "web", "prod")], &trial(json!({})))
            .expect("render");
        let patch = set.get("patch-0").expect("p");
        let parsed: Value = serde_json::from_str(&patch.body).expect("json");
        assert_eq!(parsed["apiVersion"], json!(patch.target.api_version()));
        assert_eq!(parsed["kind"], json!(patch.target.kind));
        assert_eq!(parsed["metadata"]["name"], json!(patch.target.name));
        assert_eq!(parsed["metadata"]["namespace"], json!(patch.target.namespace));
    }

    #[test]
    fn selector_matching_treats_missing_namespace_as_default() {
        let doc = Document::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web"}
        }));
        let mut selector = Selector {
            group: "apps".to_string(),
            version: "v1".to_string(),
            kind: "Deployment".to_string(),
            name: "web".to_string(),
            namespace: "default".to_string(),
        };
        assert!(selector.matches(&doc));
        selector.namespace = "prod".to_string();
        assert!(!selector.matches(&doc));
        selector.namespace.clear();
        assert!(selector.matches(&doc));
    }

    #[test]
    fn normalizes_leading_dot_access() {
        assert_eq!(
            normalize_expressions("{{.Parameters.a}} {{- .Values.b }} {{ x }}"),
            "{{ Parameters.a}} {{- Values.b }} {{ x }}"
        );
    }
}
