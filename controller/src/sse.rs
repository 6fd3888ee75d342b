//! Server-Sent Events stream of activity reports.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio::sync::broadcast;
use tracing::warn;
use trialctl::orchestrator::ReportSummary;

use crate::state::AppState;

/// SSE endpoint handler.
///
/// Emits `connected` once, then one `report` event per handled activity. The
/// stream ends when the controller shuts down.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();
    let mut shutdown = state.shutdown.clone();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            let next = tokio::select! {
                biased;
                () = shutdown.wait() => break,
                next = rx.recv() => next,
            };
            match next {
                Ok(summary) => {
                    if let Some(event) = report_event(&summary) {
                        yield Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some reports dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn report_event(summary: &ReportSummary) -> Option<Event> {
    let json = serde_json::to_string(summary).ok()?;
    Some(Event::default().event("report").id(summary.id.clone()).data(json))
}
