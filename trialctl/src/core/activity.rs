//! Remote API documents: activities, scenarios, applications, experiments, trials.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::application::ApplicationParameters;
use crate::error::{Error, Result};

/// Link relation from a scenario to its owning application.
pub const REL_UP: &str = "up";
/// Link relation from a scenario to its stored experiment template.
pub const REL_TEMPLATE: &str = "template";

/// The action an activity requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tag {
    Scan,
    Run,
    #[serde(other)]
    Unknown,
}

impl Tag {
    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Scan => "scan",
            Tag::Run => "run",
            Tag::Unknown => "unknown",
        }
    }
}

/// What an activity asks the orchestrator to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Publish the generated experiment as the scenario's template.
    Scan,
    /// Merge the stored template and deploy.
    Run,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Scan => "scan",
            Action::Run => "run",
        }
    }
}

/// One notification from the activity feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityItem {
    #[serde(default)]
    pub id: String,
    /// URL of the scenario this activity refers to.
    pub url: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ActivityItem {
    /// The action requested by the activity's single tag.
    pub fn action(&self) -> Result<Action> {
        match self.tags.as_slice() {
            [Tag::Scan] => Ok(Action::Scan),
            [Tag::Run] => Ok(Action::Run),
            [Tag::Unknown] => Err(Error::input(self.url.as_str(), "unsupported activity tag")),
            tags => Err(Error::input(
                self.url.as_str(),
                format!(
                    "invalid number of activity tags, expected 1 got {}",
                    tags.len()
                ),
            )),
        }
    }

    /// Stable identity used to de-duplicate polled items.
    pub fn identity(&self) -> &str {
        if self.id.is_empty() {
            &self.url
        } else {
            &self.id
        }
    }
}

/// Filter for the activity feed subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityFeedQuery {
    pub tags: Vec<Tag>,
}

impl ActivityFeedQuery {
    pub fn scan_and_run() -> Self {
        Self {
            tags: vec![Tag::Scan, Tag::Run],
        }
    }

    pub fn to_pairs(&self) -> Vec<(&'static str, &'static str)> {
        let mut pairs = vec![("type", "poll")];
        pairs.extend(self.tags.iter().map(|tag| ("tag", tag.as_str())));
        pairs
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityFeed {
    #[serde(default)]
    pub items: Vec<ActivityItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub rel: String,
    pub href: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objectives: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Value>,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl Scenario {
    pub fn link(&self, rel: &str) -> Option<&str> {
        self.links
            .iter()
            .find(|link| link.rel == rel && !link.href.is_empty())
            .map(|link| link.href.as_str())
    }

    /// Resolve a required link relation.
    pub fn require_link(&self, rel: &str, what: &str) -> Result<&str> {
        self.link(rel).ok_or_else(|| {
            Error::Resolution(format!(
                "no matching {what} URL for scenario {}",
                self.name
            ))
        })
    }
}

/// Application as stored by the remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiApplication {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<ApplicationParameters>,
    #[serde(default)]
    pub objectives: Vec<String>,
}

/// Experiment lookup result; only the trials collection matters here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentItem {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub trials_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialStatus {
    Staged,
    Active,
    Completed,
    Failed,
    Abandoned,
}

impl TrialStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TrialStatus::Staged => "staged",
            TrialStatus::Active => "active",
            TrialStatus::Completed => "completed",
            TrialStatus::Failed => "failed",
            TrialStatus::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialListQuery {
    pub status: Vec<TrialStatus>,
}

impl TrialListQuery {
    pub fn completed() -> Self {
        Self {
            status: vec![TrialStatus::Completed],
        }
    }

    pub fn to_pairs(&self) -> Vec<(&'static str, &'static str)> {
        self.status
            .iter()
            .map(|status| ("status", status.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub parameter_name: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialItem {
    pub number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TrialStatus>,
    #[serde(default)]
    pub assignments: Vec<Assignment>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialList {
    #[serde(default)]
    pub trials: Vec<TrialItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity(tags: Vec<Tag>) -> ActivityItem {
        ActivityItem {
            id: "a1".to_string(),
            url: "https://api.test/scenarios/1".to_string(),
            tags,
            title: None,
        }
    }

    #[test]
    fn single_known_tag_maps_to_its_action() {
        assert_eq!(activity(vec![Tag::Run]).action().expect("run"), Action::Run);
        assert_eq!(activity(vec![Tag::Scan]).action().expect("scan"), Action::Scan);
    }

    #[test]
    fn action_requires_exactly_one_tag() {
        let err = activity(Vec::new()).action().expect_err("none");
        assert!(err.to_string().contains("expected 1 got 0"));
        let err = activity(vec![Tag::Scan, Tag::Run])
            .action()
            .expect_err("many");
        assert!(err.to_string().contains("expected 1 got 2"));
    }

    #[test]
    fn unknown_tags_deserialize_and_are_rejected() {
        let item: ActivityItem =
            serde_json::from_str(r#"{"url":"u","tags":["delete"]}"#).expect("parse");
        assert_eq!(item.tags, vec![Tag::Unknown]);
        let err = item.action().expect_err("unknown");
        assert!(err.to_string().contains("unsupported activity tag"));
        assert_eq!(item.identity(), "u");
    }

    #[test]
    fn missing_link_is_resolution_error() {
        let scenario = Scenario {
            name: "s".to_string(),
            objectives: Vec::new(),
            configuration: None,
            links: vec![Link {
                rel: REL_UP.to_string(),
                href: "https://api.test/apps/1".to_string(),
            }],
        };
        assert_eq!(scenario.link(REL_UP), Some("https://api.test/apps/1"));
        let err = scenario
            .require_link(REL_TEMPLATE, "template")
            .expect_err("missing");
        assert!(matches!(err, Error::Resolution(_)));
    }

    #[test]
    fn feed_query_encodes_tags() {
        assert_eq!(
            ActivityFeedQuery::scan_and_run().to_pairs(),
            vec![("type", "poll"), ("tag", "scan"), ("tag", "run")]
        );
    }
}
