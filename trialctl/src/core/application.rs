//! Application descriptors and their assembly from remote scenarios.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::activity::{ApiApplication, Scenario};
use crate::core::experiment::ObjectMeta;

pub const APPLICATION_API_VERSION: &str = "apps.trialctl.dev/v1alpha1";

/// Higher-level description of an application: which manifest files make it up
/// and what to optimize for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<ApplicationParameters>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scenarios: Vec<ScenarioSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objectives: Vec<Objective>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_resources: Option<ContainerResources>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerResources {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSpec {
    pub name: String,
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub name: String,
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

/// Selects the workload kinds whose container resources become parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResourcesSelector {
    pub api_version: String,
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub label_selector: String,
}

impl Application {
    /// Manifest file names the application declares, reduced to base names the
    /// way input files are stored.
    pub fn resource_names(&self) -> Vec<String> {
        self.resources
            .iter()
            .map(|resource| {
                Path::new(resource)
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or(resource)
                    .to_string()
            })
            .collect()
    }

    /// Label selector restricting container resource discovery, as `k=v,k2=v2`.
    pub fn container_label_selector(&self) -> String {
        self.parameters
            .as_ref()
            .and_then(|params| params.container_resources.as_ref())
            .map(|resources| {
                resources
                    .labels
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default()
    }

    /// Default workload selectors, narrowed by the application's container labels.
    pub fn container_resources_selectors(&self) -> Vec<ContainerResourcesSelector> {
        let label_selector = self.container_label_selector();
        ["Deployment", "StatefulSet"]
            .into_iter()
            .map(|kind| ContainerResourcesSelector {
                api_version: "apps/v1".to_string(),
                kind: kind.to_string(),
                label_selector: label_selector.clone(),
            })
            .collect()
    }
}

/// Combine a remote application with one of its scenarios into the descriptor
/// handed to the experiment generator.
pub fn assemble(app: &ApiApplication, scenario: &Scenario) -> Application {
    let objectives = if scenario.objectives.is_empty() {
        app.objectives.clone()
    } else {
        scenario.objectives.clone()
    };

    let mut config = Map::new();
    if let Some(Value::Object(configuration)) = &scenario.configuration {
        config.extend(configuration.clone());
    }

    Application {
        api_version: APPLICATION_API_VERSION.to_string(),
        kind: "Application".to_string(),
        metadata: ObjectMeta {
            name: app.name.clone(),
            namespace: app.namespace.clone(),
            other: Map::new(),
        },
        resources: app.resources.clone(),
        parameters: app.parameters.clone(),
        scenarios: vec![ScenarioSpec {
            name: scenario.name.clone(),
            config,
        }],
        objectives: objectives
            .into_iter()
            .map(|name| Objective {
                name,
                config: Map::new(),
            })
            .collect(),
        other: Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn api_app() -> ApiApplication {
        ApiApplication {
            name: "shop".to_string(),
            namespace: "shop-ns".to_string(),
            resources: vec!["manifests/web.yaml".to_string()],
            parameters: Some(ApplicationParameters {
                container_resources: Some(ContainerResources {
                    labels: BTreeMap::from([
                        ("tier".to_string(), "web".to_string()),
                        ("app".to_string(), "shop".to_string()),
                    ]),
                }),
            }),
            objectives: vec!["cost".to_string()],
        }
    }

    #[test]
    fn assemble_prefers_scenario_objectives() {
        let scenario = Scenario {
            name: "black-friday".to_string(),
            objectives: vec!["p95-latency".to_string()],
            configuration: Some(json!({"locust": {"users": 100}})),
            links: Vec::new(),
        };
        let app = assemble(&api_app(), &scenario);
        assert_eq!(app.metadata.name, "shop");
        assert_eq!(app.scenarios[0].name, "black-friday");
        assert_eq!(app.scenarios[0].config["locust"]["users"], json!(100));
        let objectives: Vec<&str> = app.objectives.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(objectives, vec!["p95-latency"]);
    }

    #[test]
    fn assemble_falls_back_to_application_objectives() {
        let scenario = Scenario {
            name: "baseline".to_string(),
            objectives: Vec::new(),
            configuration: None,
            links: Vec::new(),
        };
        let app = assemble(&api_app(), &scenario);
        assert_eq!(app.objectives[0].name, "cost");
    }

    #[test]
    fn resource_names_use_base_names() {
        let app = assemble(
            &api_app(),
            &Scenario {
                name: "s".to_string(),
                objectives: Vec::new(),
                configuration: None,
                links: Vec::new(),
            },
        );
        assert_eq!(app.resource_names(), vec!["web.yaml".to_string()]);
    }

    #[test]
    fn selectors_inherit_sorted_container_labels() {
        let app = assemble(
            &api_app(),
            &Scenario {
                name: "s".to_string(),
                objectives: Vec::new(),
                configuration: None,
                links: Vec::new(),
            },
        );
        let selectors = app.container_resources_selectors();
        assert_eq!(selectors.len(), 2);
        assert!(
            selectors
                .iter()
                .all(|sel| sel.label_selector == "app=shop,tier=web")
        );
    }
}
