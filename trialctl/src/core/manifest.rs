//! Multi-document manifest sets and kind-based extraction.
//!
//! Every input source is split into YAML documents and classified by `kind`.
//! Extraction by kind never fails on zero matches; only malformed input
//! (invalid YAML, non-mapping documents) is an error.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::overlay::FileSet;
use crate::error::{Error, Result};

/// Known resource kinds, plus an explicit branch for everything else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Application,
    Experiment,
    ServiceAccount,
    ClusterRole,
    ClusterRoleBinding,
    ConfigMap,
    Other(String),
}

impl ResourceKind {
    pub fn from_kind(kind: &str) -> Self {
        match kind {
            "Application" => ResourceKind::Application,
            "Experiment" => ResourceKind::Experiment,
            "ServiceAccount" => ResourceKind::ServiceAccount,
            "ClusterRole" => ResourceKind::ClusterRole,
            "ClusterRoleBinding" => ResourceKind::ClusterRoleBinding,
            "ConfigMap" => ResourceKind::ConfigMap,
            other => ResourceKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ResourceKind::Application => "Application",
            ResourceKind::Experiment => "Experiment",
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::ClusterRole => "ClusterRole",
            ResourceKind::ClusterRoleBinding => "ClusterRoleBinding",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Other(kind) => kind,
        }
    }

    /// Human-readable label used in deploy error prefixes.
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Application => "application",
            ResourceKind::Experiment => "experiment",
            ResourceKind::ServiceAccount => "service account",
            ResourceKind::ClusterRole => "cluster role",
            ResourceKind::ClusterRoleBinding => "cluster role binding",
            ResourceKind::ConfigMap => "config map",
            ResourceKind::Other(_) => "resource",
        }
    }

    /// Cluster-scoped kinds are addressed without a namespace.
    pub fn is_cluster_scoped(&self) -> bool {
        matches!(
            self,
            ResourceKind::ClusterRole | ResourceKind::ClusterRoleBinding
        )
    }
}

/// A single parsed manifest document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub kind: ResourceKind,
    pub value: Value,
}

impl Document {
    pub fn from_value(value: Value) -> Self {
        let kind = ResourceKind::from_kind(value.get("kind").and_then(Value::as_str).unwrap_or(""));
        Self { kind, value }
    }

    pub fn api_version(&self) -> &str {
        self.value
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.metadata_str("name").unwrap_or("")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata_str("namespace").filter(|ns| !ns.is_empty())
    }

    fn metadata_str(&self, field: &str) -> Option<&str> {
        self.value
            .get("metadata")
            .and_then(|meta| meta.get(field))
            .and_then(Value::as_str)
    }
}

/// An ordered collection of manifest documents from one or more sources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestSet {
    documents: Vec<Document>,
}

impl ManifestSet {
    /// Parse a multi-document YAML stream. `source` names the input in errors.
    pub fn from_bytes(source: &str, data: &[u8]) -> Result<Self> {
        let mut set = ManifestSet::default();
        set.extend_from_bytes(source, data)?;
        Ok(set)
    }

    /// Append all documents from `data`, preserving their order.
    pub fn extend_from_bytes(&mut self, source: &str, data: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(data).map_err(|err| Error::input(source, err))?;
        for (index, de) in serde_yaml::Deserializer::from_str(text).enumerate() {
            let value = Value::deserialize(de)
                .map_err(|err| Error::input(source, format!("document {index}: {err}")))?;
            match value {
                Value::Null => continue,
                Value::Object(_) => self.documents.push(Document::from_value(value)),
                _ => {
                    return Err(Error::input(
                        source,
                        format!("document {index} is not a mapping"),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn documents_mut(&mut self) -> &mut [Document] {
        &mut self.documents
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Every document of the given kind, in input order.
    ///
    /// The iterator borrows only the set, so `kind` may be a temporary.
    pub fn of_kind<'a>(
        &'a self,
        kind: &ResourceKind,
    ) -> impl Iterator<Item = &'a Document> + use<'a> {
        let kind = kind.clone();
        self.documents.iter().filter(move |doc| doc.kind == kind)
    }

    /// Render the set as one normalized multi-document YAML stream.
    pub fn to_yaml(&self) -> Result<String> {
        let mut out = String::new();
        for (index, doc) in self.documents.iter().enumerate() {
            if index > 0 {
                out.push_str("---\n");
            }
            let rendered = serde_yaml::to_string(&doc.value)
                .map_err(|err| Error::input(doc.name(), err))?;
            out.push_str(&rendered);
        }
        Ok(out)
    }
}

/// Parse the named files of `files` into one set, in the order given.
pub fn aggregate(files: &dyn FileSet, names: &[String]) -> Result<ManifestSet> {
    let mut set = ManifestSet::default();
    for name in names {
        let data = files
            .read(name)
            .ok_or_else(|| Error::input(name.as_str(), "not found in file set"))?;
        set.extend_from_bytes(name, data)?;
    }
    Ok(set)
}

/// Deserialize the single document of `kind`.
///
/// Zero matches yields `Ok(None)`; more than one is ambiguous and rejected.
pub fn extract_single<T: DeserializeOwned>(
    set: &ManifestSet,
    kind: &ResourceKind,
) -> Result<Option<T>> {
    let mut matches = set.of_kind(kind);
    let Some(first) = matches.next() else {
        return Ok(None);
    };
    if matches.next().is_some() {
        return Err(Error::Resolution(format!(
            "expected at most one {}, found several",
            kind.as_str()
        )));
    }
    let typed = serde_json::from_value(first.value.clone())
        .map_err(|err| Error::input(format!("{} {}", kind.as_str(), first.name()), err))?;
    Ok(Some(typed))
}
