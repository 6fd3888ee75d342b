//! Activity-driven orchestration loop.
//!
//! The loop waits on either shutdown or the next activity and handles one
//! activity at a time, in arrival order. Every activity produces exactly one
//! [`ActivityReport`] on the report channel, whether it succeeded or not.
//! Failures abandon only the current activity; nothing is retried.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::core::activity::{Action, ActivityFeedQuery, ActivityItem, REL_TEMPLATE, REL_UP};
use crate::core::application::assemble;
use crate::core::experiment::Experiment;
use crate::core::manifest::{ManifestSet, ResourceKind, extract_single};
use crate::core::template::{apply_template, experiment_to_template};
use crate::deploy::{DeployReport, deploy_all};
use crate::error::{Error, Result};
use crate::io::api::ApplicationsApi;
use crate::io::cluster::Cluster;
use crate::io::generator::Generator;
use crate::shutdown::Shutdown;

/// What a successfully handled activity did.
#[derive(Debug)]
pub enum ActivityOutcome {
    /// The experiment template was uploaded.
    Scanned {
        experiment: String,
        template_url: String,
    },
    /// Resources were deployed; individual resources may still have failed.
    Ran {
        experiment: String,
        deploy: DeployReport,
    },
}

/// One report per received activity.
#[derive(Debug)]
pub struct ActivityReport {
    pub id: String,
    pub url: String,
    pub tag: Option<Action>,
    pub outcome: Result<ActivityOutcome>,
}

/// Serializable digest of an [`ActivityReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub id: String,
    pub url: String,
    pub tag: Option<&'static str>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ActivityReport {
    pub fn is_success(&self) -> bool {
        match &self.outcome {
            Ok(ActivityOutcome::Scanned { .. }) => true,
            Ok(ActivityOutcome::Ran { deploy, .. }) => deploy.is_success(),
            Err(_) => false,
        }
    }

    /// Every error carried by the report, rendered for logs.
    pub fn error_messages(&self) -> Vec<String> {
        match &self.outcome {
            Ok(ActivityOutcome::Scanned { .. }) => Vec::new(),
            Ok(ActivityOutcome::Ran { deploy, .. }) => {
                deploy.errors.iter().map(ToString::to_string).collect()
            }
            Err(err) => vec![err.to_string()],
        }
    }

    pub fn summary(&self) -> ReportSummary {
        let experiment = match &self.outcome {
            Ok(ActivityOutcome::Scanned { experiment, .. } | ActivityOutcome::Ran { experiment, .. }) => {
                Some(experiment.clone())
            }
            Err(_) => None,
        };
        ReportSummary {
            id: self.id.clone(),
            url: self.url.clone(),
            tag: self.tag.map(Action::as_str),
            status: if self.is_success() { "ok" } else { "failed" },
            experiment,
            errors: self.error_messages(),
        }
    }
}

/// Drives Scan and Run activities against the API, generator, and cluster.
#[derive(Clone)]
pub struct Orchestrator {
    api: Arc<dyn ApplicationsApi>,
    cluster: Arc<dyn Cluster>,
    generator: Arc<dyn Generator>,
}

impl Orchestrator {
    pub fn new(
        api: Arc<dyn ApplicationsApi>,
        cluster: Arc<dyn Cluster>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            api,
            cluster,
            generator,
        }
    }

    /// Consume the activity feed until shutdown or until the subscription ends.
    ///
    /// # Errors
    ///
    /// Only a failure to subscribe is returned; per-activity failures are
    /// delivered as reports.
    pub async fn run(
        &self,
        mut shutdown: Shutdown,
        reports: mpsc::Sender<ActivityReport>,
    ) -> Result<()> {
        let mut activities = self
            .api
            .subscribe_activity(&ActivityFeedQuery::scan_and_run(), shutdown.clone())
            .await?;
        info!("orchestrator started");

        loop {
            let activity = tokio::select! {
                biased;
                () = shutdown.wait() => {
                    info!("shutdown requested, stopping orchestrator");
                    break;
                }
                next = activities.recv() => match next {
                    Some(activity) => activity,
                    None => {
                        info!("activity subscription closed");
                        break;
                    }
                },
            };

            let report = self.handle(activity).await;
            if reports.send(report).await.is_err() {
                warn!("activity report receiver dropped");
            }
        }

        Ok(())
    }

    /// Handle one activity and wrap the result in a report.
    pub async fn handle(&self, activity: ActivityItem) -> ActivityReport {
        let tag = activity.action().ok();
        let outcome = self.handle_activity(&activity).await;
        ActivityReport {
            id: activity.id,
            url: activity.url,
            tag,
            outcome,
        }
    }

    #[instrument(skip_all, fields(id = %activity.id, url = %activity.url))]
    async fn handle_activity(&self, activity: &ActivityItem) -> Result<ActivityOutcome> {
        let action = activity.action()?;

        let scenario = self.api.get_scenario(&activity.url).await?;
        let application_url = scenario.require_link(REL_UP, "application")?;
        let template_url = scenario.require_link(REL_TEMPLATE, "template")?;

        let api_app = self.api.get_application(application_url).await?;
        let app = assemble(&api_app, &scenario);

        let generator = Arc::clone(&self.generator);
        let generated = tokio::task::spawn_blocking(move || generator.generate(&app))
            .await
            .map_err(|err| Error::Render {
                template: "generator".to_string(),
                message: err.to_string(),
            })??;
        let manifests = ManifestSet::from_bytes("generated assets", &generated)?;
        let mut experiment: Experiment = extract_single(&manifests, &ResourceKind::Experiment)?
            .ok_or_else(|| {
                Error::Resolution(format!(
                    "no experiment generated for application {}",
                    api_app.name
                ))
            })?;

        match action {
            Action::Scan => {
                let template = experiment_to_template(&experiment);
                self.api.update_template(template_url, &template).await?;
                info!(experiment = %experiment.metadata.name, "experiment template uploaded");
                Ok(ActivityOutcome::Scanned {
                    experiment: experiment.metadata.name,
                    template_url: template_url.to_string(),
                })
            }
            Action::Run => {
                let stored = self.api.get_template(template_url).await?;
                apply_template(&mut experiment, &stored);
                let deploy = deploy_all(self.cluster.as_ref(), &manifests, &experiment).await;
                info!(
                    experiment = %experiment.metadata.name,
                    deployed = deploy.outcomes.len(),
                    failed = deploy.errors.len(),
                    "experiment deployed"
                );
                Ok(ActivityOutcome::Ran {
                    experiment: experiment.metadata.name,
                    deploy,
                })
            }
        }
    }
}
