//! Cluster access for the Resource Deployer.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::core::experiment::split_api_version;
use crate::core::manifest::{Document, ResourceKind};
use crate::io::config::KubectlConfig;

/// Identifies one cluster object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub api_version: String,
    pub name: String,
    /// `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
}

impl ResourceKey {
    pub fn from_document(doc: &Document) -> Self {
        let namespace = if doc.kind.is_cluster_scoped() {
            None
        } else {
            Some(doc.namespace().unwrap_or("default").to_string())
        };
        Self {
            kind: doc.kind.clone(),
            api_version: doc.api_version().to_string(),
            name: doc.name().to_string(),
            namespace,
        }
    }

    /// Fully qualified resource type as kubectl accepts it (`Kind.version.group`).
    pub fn qualified_type(&self) -> String {
        let (group, version) = split_api_version(&self.api_version);
        if group.is_empty() {
            self.kind.as_str().to_string()
        } else {
            format!("{}.{version}.{group}", self.kind.as_str())
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {ns}/{}", self.kind.as_str(), self.name),
            None => write!(f, "{} {}", self.kind.as_str(), self.name),
        }
    }
}

/// Get/Create/Update against the live cluster.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// `Ok(None)` only when the object genuinely does not exist.
    async fn get(&self, key: &ResourceKey) -> Result<Option<Value>>;
    async fn create(&self, object: &Value) -> Result<()>;
    async fn update(&self, object: &Value) -> Result<()>;
}

/// [`Cluster`] implementation that shells out to kubectl.
#[derive(Debug, Clone)]
pub struct KubectlCluster {
    command: Vec<String>,
    timeout: Duration,
}

impl KubectlCluster {
    pub fn new(config: &KubectlConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: config.timeout(),
        }
    }

    async fn run(&self, args: &[String], stdin: Option<&[u8]>) -> Result<KubectlOutput> {
        let (program, prefix) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("kubectl command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(prefix)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(?args, "running kubectl");
        let mut child = cmd.spawn().with_context(|| format!("spawn {program}"))?;
        if let Some(input) = stdin {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            pipe.write_all(input).await.context("write kubectl stdin")?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("kubectl timed out after {}s", self.timeout.as_secs()))?
            .context("wait for kubectl")?;

        Ok(KubectlOutput {
            success: output.status.success(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn apply_with(&self, verb: &str, object: &Value) -> Result<()> {
        let body = serde_json::to_vec(object).context("serialize object")?;
        let out = self.run(&write_args(verb), Some(&body)).await?;
        if !out.success {
            bail!("kubectl {verb}: {}", out.stderr);
        }
        Ok(())
    }
}

struct KubectlOutput {
    success: bool,
    stdout: Vec<u8>,
    stderr: String,
}

#[async_trait]
impl Cluster for KubectlCluster {
    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &ResourceKey) -> Result<Option<Value>> {
        let out = self.run(&get_args(key), None).await?;
        if out.success {
            let value = serde_json::from_slice(&out.stdout).context("parse kubectl get output")?;
            return Ok(Some(value));
        }
        if is_not_found(&out.stderr) {
            return Ok(None);
        }
        bail!("kubectl get: {}", out.stderr)
    }

    async fn create(&self, object: &Value) -> Result<()> {
        self.apply_with("create", object).await
    }

    async fn update(&self, object: &Value) -> Result<()> {
        self.apply_with("replace", object).await
    }
}

fn get_args(key: &ResourceKey) -> Vec<String> {
    let mut args = vec!["get".to_string(), key.qualified_type(), key.name.clone()];
    if let Some(namespace) = &key.namespace {
        args.push("--namespace".to_string());
        args.push(namespace.clone());
    }
    args.push("--output".to_string());
    args.push("json".to_string());
    args
}

fn write_args(verb: &str) -> Vec<String> {
    vec![verb.to_string(), "--filename".to_string(), "-".to_string()]
}

/// kubectl reports absent objects as `Error from server (NotFound): ...`.
fn is_not_found(stderr: &str) -> bool {
    stderr.contains("(NotFound)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(kind: &str, api_version: &str, namespace: Option<&str>) -> ResourceKey {
        ResourceKey {
            kind: ResourceKind::from_kind(kind),
            api_version: api_version.to_string(),
            name: "shop".to_string(),
            namespace: namespace.map(str::to_string),
        }
    }

    #[test]
    fn qualifies_grouped_types() {
        assert_eq!(
            key("Experiment", "optimize.trialctl.dev/v1beta2", Some("default")).qualified_type(),
            "Experiment.v1beta2.optimize.trialctl.dev"
        );
        assert_eq!(key("ConfigMap", "v1", Some("x")).qualified_type(), "ConfigMap");
    }

    #[test]
    fn get_args_scope_namespaced_kinds() {
        assert_eq!(
            get_args(&key("ServiceAccount", "v1", Some("load"))),
            vec!["get", "ServiceAccount", "shop", "--namespace", "load", "--output", "json"]
        );
        assert_eq!(
            get_args(&key("ClusterRole", "rbac.authorization.k8s.io/v1", None)),
            vec![
                "get",
                "ClusterRole.v1.rbac.authorization.k8s.io",
                "shop",
                "--output",
                "json"
            ]
        );
    }

    #[test]
    fn key_from_document_defaults_namespace() {
        let doc = Document::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "settings"}
        }));
        let key = ResourceKey::from_document(&doc);
        assert_eq!(key.namespace.as_deref(), Some("default"));
        assert_eq!(key.to_string(), "ConfigMap default/settings");

        let doc = Document::from_value(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRoleBinding",
            "metadata": {"name": "binding", "namespace": "ignored"}
        }));
        assert_eq!(ResourceKey::from_document(&doc).namespace, None);
    }

    #[test]
    fn classifies_not_found() {
        assert!(is_not_found(
            "Error from server (NotFound): configmaps \"settings\" not found"
        ));
        assert!(!is_not_found(
            "Unable to connect to the server: dial tcp 10.0.0.1:443: i/o timeout"
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_get_is_error_not_absent() {
        let cluster = KubectlCluster::new(&KubectlConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo 'connection refused' >&2; exit 1".to_string(),
                "kubectl".to_string(),
            ],
            timeout_secs: 10,
        });
        let err = cluster
            .get(&key("ConfigMap", "v1", Some("default")))
            .await
            .expect_err("transient failure");
        assert!(err.to_string().contains("connection refused"));
    }
}
