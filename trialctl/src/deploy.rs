//! Resource Deployer: reconcile generated resources and the Experiment.
//!
//! Each resource is fetched first. Absent resources are created; ConfigMaps and
//! the Experiment are replaced when present, while RBAC objects are left as
//! they are. Every resource gets exactly one attempt and a failure never stops
//! the remaining resources.

use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::experiment::Experiment;
use crate::core::manifest::{Document, ManifestSet, ResourceKind};
use crate::error::Error;
use crate::io::cluster::{Cluster, ResourceKey};

/// Supporting kinds in the order they are deployed; the Experiment goes last.
pub const DEPLOY_ORDER: [ResourceKind; 4] = [
    ResourceKind::ServiceAccount,
    ResourceKind::ClusterRole,
    ResourceKind::ClusterRoleBinding,
    ResourceKind::ConfigMap,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployAction {
    Created,
    Updated,
    /// Present already and not eligible for update.
    Unchanged,
}

impl DeployAction {
    pub fn as_str(self) -> &'static str {
        match self {
            DeployAction::Created => "created",
            DeployAction::Updated => "updated",
            DeployAction::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceOutcome {
    pub key: ResourceKey,
    pub action: DeployAction,
}

/// What happened to each resource of one deployment pass.
#[derive(Debug, Default)]
pub struct DeployReport {
    pub outcomes: Vec<ResourceOutcome>,
    pub errors: Vec<Error>,
}

impl DeployReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    fn record(&mut self, key: ResourceKey, result: Result<DeployAction, Error>) {
        match result {
            Ok(action) => {
                info!(resource = %key, action = action.as_str(), "deployed");
                self.outcomes.push(ResourceOutcome { key, action });
            }
            Err(err) => {
                warn!(resource = %key, error = %err, "deploy failed");
                self.errors.push(err);
            }
        }
    }
}

fn upserts(kind: &ResourceKind) -> bool {
    matches!(kind, ResourceKind::ConfigMap | ResourceKind::Experiment)
}

/// Deploy the supporting resources of `manifests` followed by `experiment`.
///
/// Kinds absent from `manifests` are skipped; other kinds (Deployments,
/// Applications) are never deployed here.
#[instrument(skip_all, fields(experiment = %experiment.metadata.name))]
pub async fn deploy_all(
    cluster: &dyn Cluster,
    manifests: &ManifestSet,
    experiment: &Experiment,
) -> DeployReport {
    let mut report = DeployReport::default();

    for kind in &DEPLOY_ORDER {
        for doc in manifests.of_kind(kind) {
            let key = ResourceKey::from_document(doc);
            let result = deploy_one(cluster, &key, &doc.value).await;
            report.record(key, result);
        }
    }

    let doc = Document::from_value(experiment.to_value());
    let key = ResourceKey::from_document(&doc);
    let result = deploy_one(cluster, &key, &doc.value).await;
    report.record(key, result);

    report
}

async fn deploy_one(
    cluster: &dyn Cluster,
    key: &ResourceKey,
    desired: &Value,
) -> Result<DeployAction, Error> {
    let resource = key.kind.label();
    let failed = |operation: &'static str, err: anyhow::Error| Error::Deploy {
        resource,
        operation,
        message: format!("{err:#}"),
    };

    if key.name.is_empty() {
        return Err(Error::Deploy {
            resource,
            operation: "validate",
            message: "metadata.name is empty".to_string(),
        });
    }

    let mut desired = desired.clone();
    pin_namespace(&mut desired, key);

    match cluster.get(key).await.map_err(|err| failed("get", err))? {
        None => {
            cluster
                .create(&desired)
                .await
                .map_err(|err| failed("create", err))?;
            Ok(DeployAction::Created)
        }
        Some(existing) if upserts(&key.kind) => {
            carry_resource_version(&mut desired, &existing);
            cluster
                .update(&desired)
                .await
                .map_err(|err| failed("update", err))?;
            Ok(DeployAction::Updated)
        }
        Some(_) => Ok(DeployAction::Unchanged),
    }
}

/// Write the looked-up namespace into the object, so create and replace land
/// where get looked instead of in the client's context namespace.
fn pin_namespace(desired: &mut Value, key: &ResourceKey) {
    let Some(namespace) = &key.namespace else {
        return;
    };
    if let Some(Value::Object(metadata)) = desired.get_mut("metadata") {
        metadata.insert("namespace".to_string(), Value::String(namespace.clone()));
    }
}

/// Copy the live object's `resourceVersion` so the replace is accepted.
fn carry_resource_version(desired: &mut Value, existing: &Value) {
    let Some(version) = existing
        .pointer("/metadata/resourceVersion")
        .filter(|v| v.is_string())
        .cloned()
    else {
        return;
    };
    if let Some(Value::Object(metadata)) = desired.get_mut("metadata") {
        metadata.insert("resourceVersion".to_string(), version);
    }
}
