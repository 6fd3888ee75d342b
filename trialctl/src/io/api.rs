//! Remote experiments/applications API.
//!
//! The orchestrator and the patch pipeline depend only on the
//! [`ExperimentsApi`] and [`ApplicationsApi`] traits; [`HttpApi`] is the
//! reqwest-backed implementation used by the binaries.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::core::activity::{
    ActivityFeed, ActivityFeedQuery, ActivityItem, ApiApplication, ExperimentItem, Scenario,
    TrialList, TrialListQuery,
};
use crate::core::template::ExperimentTemplate;
use crate::error::{Error, Result};
use crate::io::config::{ApiConfig, ControllerConfig};
use crate::shutdown::Shutdown;

/// Experiment and trial lookups used by trial resolution.
#[async_trait]
pub trait ExperimentsApi: Send + Sync {
    async fn get_experiment_by_name(&self, name: &str) -> Result<ExperimentItem>;
    async fn get_all_trials(&self, url: &str, query: &TrialListQuery) -> Result<TrialList>;
}

/// Activity feed, scenario, application, and template endpoints.
#[async_trait]
pub trait ApplicationsApi: Send + Sync {
    /// Start delivering activity items. The channel closes when `shutdown`
    /// fires or the subscription ends.
    async fn subscribe_activity(
        &self,
        query: &ActivityFeedQuery,
        shutdown: Shutdown,
    ) -> Result<mpsc::Receiver<ActivityItem>>;
    async fn get_scenario(&self, url: &str) -> Result<Scenario>;
    async fn get_application(&self, url: &str) -> Result<ApiApplication>;
    async fn get_template(&self, url: &str) -> Result<ExperimentTemplate>;
    async fn update_template(&self, url: &str, template: &ExperimentTemplate) -> Result<()>;
}

/// HTTP/JSON client for the remote API.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: Client,
    base_url: String,
    token: Option<String>,
    poll_interval: Duration,
    activity_buffer: usize,
}

impl HttpApi {
    /// Build a client from configuration.
    ///
    /// # Errors
    ///
    /// Fails when no API address is configured or the HTTP client cannot be built.
    pub fn new(api: &ApiConfig, controller: &ControllerConfig) -> Result<Self> {
        let base_url = api.address.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(Error::remote(
                "configure",
                "the current configuration does not include the API server address",
            ));
        }
        let client = Client::builder()
            .timeout(api.timeout())
            .build()
            .map_err(|err| Error::remote("configure", err))?;

        Ok(Self {
            client,
            base_url,
            token: api.token.clone().filter(|token| !token.is_empty()),
            poll_interval: api.poll_interval(),
            activity_buffer: controller.activity_buffer,
        })
    }

    /// Absolute URL for `url`, which may be absolute or relative to the base.
    pub fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let req = self.authorized(self.client.get(self.resolve_url(url)).query(query));
        let response = req
            .send()
            .await
            .map_err(|err| Error::remote(operation, err))?;
        let response = check_status(operation, response).await?;
        response
            .json()
            .await
            .map_err(|err| Error::remote(operation, format!("failed to parse response: {err}")))
    }

    async fn fetch_feed(&self, query: &[(&str, &str)]) -> Result<ActivityFeed> {
        self.get_json("subscribe activity", "/v1/applications/activity", query)
            .await
    }
}

/// Ids already delivered from the activity feed.
///
/// Only ids the latest page still lists are remembered, so the set stays as
/// small as the feed.
#[derive(Debug, Default)]
struct SeenActivities {
    ids: HashSet<String>,
}

impl SeenActivities {
    /// Items of a fetched page that have not been delivered yet. A failed
    /// fetch yields nothing and leaves the set untouched.
    fn next_batch(&mut self, fetched: Result<ActivityFeed>) -> Vec<ActivityItem> {
        let feed = match fetched {
            Ok(feed) => feed,
            Err(err) => {
                warn!(error = %err, "activity feed poll failed");
                return Vec::new();
            }
        };
        let listed: HashSet<&str> = feed.items.iter().map(ActivityItem::identity).collect();
        self.ids.retain(|id| listed.contains(id.as_str()));
        feed.items
            .into_iter()
            .filter(|item| self.ids.insert(item.identity().to_string()))
            .collect()
    }
}

async fn check_status(operation: &'static str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::remote(operation, format!("API error ({status}): {body}")))
}

#[async_trait]
impl ExperimentsApi for HttpApi {
    #[instrument(skip(self))]
    async fn get_experiment_by_name(&self, name: &str) -> Result<ExperimentItem> {
        self.get_json("get experiment", &format!("/v1/experiments/{name}"), &[])
            .await
    }

    #[instrument(skip(self, query))]
    async fn get_all_trials(&self, url: &str, query: &TrialListQuery) -> Result<TrialList> {
        self.get_json("get trials", url, &query.to_pairs()).await
    }
}

#[async_trait]
impl ApplicationsApi for HttpApi {
    #[instrument(skip_all)]
    async fn subscribe_activity(
        &self,
        query: &ActivityFeedQuery,
        mut shutdown: Shutdown,
    ) -> Result<mpsc::Receiver<ActivityItem>> {
        let pairs = query.to_pairs();
        let first = self.fetch_feed(&pairs).await?;
        let (tx, rx) = mpsc::channel(self.activity_buffer);
        let api = self.clone();

        tokio::spawn(async move {
            let mut seen = SeenActivities::default();
            let mut pending = seen.next_batch(Ok(first));
            loop {
                for item in pending.drain(..) {
                    debug!(id = %item.identity(), url = %item.url, "activity received");
                    tokio::select! {
                        biased;
                        () = shutdown.wait() => return,
                        sent = tx.send(item) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
                tokio::select! {
                    biased;
                    () = shutdown.wait() => return,
                    () = tokio::time::sleep(api.poll_interval) => {}
                }
                pending = seen.next_batch(api.fetch_feed(&pairs).await);
            }
        });

        Ok(rx)
    }

    #[instrument(skip(self))]
    async fn get_scenario(&self, url: &str) -> Result<Scenario> {
        self.get_json("get scenario", url, &[]).await
    }

    #[instrument(skip(self))]
    async fn get_application(&self, url: &str) -> Result<ApiApplication> {
        self.get_json("get application", url, &[]).await
    }

    #[instrument(skip(self))]
    async fn get_template(&self, url: &str) -> Result<ExperimentTemplate> {
        self.get_json("get template", url, &[]).await
    }

    #[instrument(skip(self, template))]
    async fn update_template(&self, url: &str, template: &ExperimentTemplate) -> Result<()> {
        let operation = "update template";
        let req = self.authorized(self.client.put(self.resolve_url(url)).json(template));
        let response = req
            .send()
            .await
            .map_err(|err| Error::remote(operation, err))?;
        check_status(operation, response).await?;
        Ok(())
    }
}
