//! Shared state for the controller's HTTP surface.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use trialctl::orchestrator::ReportSummary;
use trialctl::shutdown::Shutdown;

/// Running tally of handled activities.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerStatus {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_report: Option<ReportSummary>,
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub status: Arc<RwLock<ControllerStatus>>,
    /// Broadcast sender for activity reports.
    pub event_tx: Arc<broadcast::Sender<ReportSummary>>,
    pub shutdown: Shutdown,
}

impl AppState {
    pub fn new(shutdown: Shutdown, capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            status: Arc::new(RwLock::new(ControllerStatus::default())),
            event_tx: Arc::new(event_tx),
            shutdown,
        }
    }

    /// Fold a report into the counters and fan it out to event subscribers.
    pub async fn record(&self, summary: ReportSummary) {
        {
            let mut status = self.status.write().await;
            status.received += 1;
            if summary.status == "ok" {
                status.succeeded += 1;
            } else {
                status.failed += 1;
            }
            status.last_report = Some(summary.clone());
        }
        // No subscribers is fine.
        let _ = self.event_tx.send(summary);
    }
}
