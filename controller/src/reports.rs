//! Drains activity reports produced by the orchestrator.

use tokio::sync::mpsc;
use tracing::{info, warn};
use trialctl::orchestrator::{ActivityOutcome, ActivityReport};

use crate::state::AppState;

/// Log every report and record it in the shared state until the orchestrator
/// drops its sender.
pub async fn consume_reports(state: AppState, mut reports: mpsc::Receiver<ActivityReport>) {
    while let Some(report) = reports.recv().await {
        log_report(&report);
        state.record(report.summary()).await;
    }
    info!("report channel closed");
}

fn log_report(report: &ActivityReport) {
    match &report.outcome {
        Ok(ActivityOutcome::Scanned {
            experiment,
            template_url,
        }) => info!(
            activity = %report.id,
            experiment = %experiment,
            template = %template_url,
            "experiment template uploaded"
        ),
        Ok(ActivityOutcome::Ran { experiment, deploy }) if deploy.is_success() => info!(
            activity = %report.id,
            experiment = %experiment,
            resources = deploy.outcomes.len(),
            "experiment deployed"
        ),
        _ => {
            for message in report.error_messages() {
                warn!(activity = %report.id, url = %report.url, error = %message, "activity failed");
            }
        }
    }
}
