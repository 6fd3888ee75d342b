//! Test-only fakes and fixtures for the API, cluster, and generator seams.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::bail;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::activity::{
    ActivityFeedQuery, ActivityItem, ApiApplication, Assignment, ExperimentItem, Link, REL_TEMPLATE,
    REL_UP, Scenario, Tag, TrialItem, TrialList, TrialListQuery, TrialStatus,
};
use crate::core::application::{Application, ApplicationParameters, ContainerResources};
use crate::core::experiment::Experiment;
use crate::core::template::ExperimentTemplate;
use crate::error::{Error, Result};
use crate::io::api::{ApplicationsApi, ExperimentsApi};
use crate::io::cluster::{Cluster, ResourceKey};
use crate::io::generator::Generator;
use crate::shutdown::Shutdown;

pub const EXPERIMENT_YAML: &str = "\
apiVersion: optimize.trialctl.dev/v1beta2
kind: Experiment
metadata:
  name: shop-black-friday
  namespace: shop
spec:
  parameters:
    - name: replicas
      min: 1
      max: 4
      baseline: 1
  metrics:
    - name: cost
      minimize: true
  patches:
    - targetRef:
        apiVersion: apps/v1
        kind: Deployment
        name: web
      patch: '{\"spec\":{\"replicas\":\"{{ .Parameters.replicas }}\"}}'
";

pub const DEPLOYMENT_YAML: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  labels:
    app: shop
spec:
  replicas: 1
  template:
    spec:
      containers:
        - name: app
          image: shop:1.0
";

pub const APPLICATION_YAML: &str = "\
apiVersion: apps.trialctl.dev/v1alpha1
kind: Application
metadata:
  name: shop
  namespace: shop
resources:
  - manifests/web.yaml
parameters:
  containerResources:
    labels:
      app: shop
objectives:
  - name: cost
";

pub const SCENARIO_URL: &str = "/v1/applications/shop/scenarios/black-friday";
pub const APPLICATION_URL: &str = "/v1/applications/shop";
pub const TEMPLATE_URL: &str = "/v1/applications/shop/scenarios/black-friday/template";

/// Supporting assets plus the Experiment, as a generator would print them.
pub fn generated_assets_yaml() -> String {
    format!(
        "\
apiVersion: v1
kind: ServiceAccount
metadata:
  name: shop-trials
  namespace: shop
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: shop-trials
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: shop-trials
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: shop-locust
  namespace: shop
data:
  users: \"10\"
---
{EXPERIMENT_YAML}"
    )
}

pub fn experiment_fixture() -> Experiment {
    serde_yaml::from_str(EXPERIMENT_YAML).expect("experiment fixture parses")
}

pub fn application_fixture() -> Application {
    serde_yaml::from_str(APPLICATION_YAML).expect("application fixture parses")
}

pub fn api_application_fixture() -> ApiApplication {
    ApiApplication {
        name: "shop".to_string(),
        namespace: "shop".to_string(),
        resources: vec!["manifests/web.yaml".to_string()],
        parameters: Some(ApplicationParameters {
            container_resources: Some(ContainerResources {
                labels: BTreeMap::from([("app".to_string(), "shop".to_string())]),
            }),
        }),
        objectives: vec!["cost".to_string()],
    }
}

pub fn scenario_fixture() -> Scenario {
    Scenario {
        name: "black-friday".to_string(),
        objectives: Vec::new(),
        configuration: None,
        links: vec![
            Link {
                rel: REL_UP.to_string(),
                href: APPLICATION_URL.to_string(),
            },
            Link {
                rel: REL_TEMPLATE.to_string(),
                href: TEMPLATE_URL.to_string(),
            },
        ],
    }
}

pub fn activity(id: &str, tags: Vec<Tag>) -> ActivityItem {
    ActivityItem {
        id: id.to_string(),
        url: SCENARIO_URL.to_string(),
        tags,
        title: None,
    }
}

/// In-memory remote API that records every call.
#[derive(Debug, Default)]
pub struct FakeApi {
    experiments: HashMap<String, ExperimentItem>,
    trials: HashMap<String, Vec<TrialItem>>,
    scenarios: HashMap<String, Scenario>,
    applications: HashMap<String, ApiApplication>,
    templates: Mutex<HashMap<String, ExperimentTemplate>>,
    activities: Mutex<Vec<ActivityItem>>,
    keep_open: bool,
    held_sender: Mutex<Option<mpsc::Sender<ActivityItem>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeApi {
    /// Register a completed trial with the given parameter assignments.
    pub fn with_trial(mut self, experiment: &str, number: u64, assignments: Value) -> Self {
        let url = format!("/v1/experiments/{experiment}/trials");
        self.experiments.insert(
            experiment.to_string(),
            ExperimentItem {
                name: experiment.to_string(),
                trials_url: url.clone(),
            },
        );
        let assignments = assignments
            .as_object()
            .map(|map| {
                map.iter()
                    .map(|(name, value)| Assignment {
                        parameter_name: name.clone(),
                        value: value.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        self.trials.entry(url).or_default().push(TrialItem {
            number,
            status: Some(TrialStatus::Completed),
            assignments,
            labels: BTreeMap::new(),
        });
        self
    }

    pub fn with_experiment_without_trials(mut self, experiment: &str) -> Self {
        self.experiments.insert(
            experiment.to_string(),
            ExperimentItem {
                name: experiment.to_string(),
                trials_url: String::new(),
            },
        );
        self
    }

    pub fn with_scenario(mut self, url: &str, scenario: Scenario) -> Self {
        self.scenarios.insert(url.to_string(), scenario);
        self
    }

    pub fn with_application(mut self, url: &str, app: ApiApplication) -> Self {
        self.applications.insert(url.to_string(), app);
        self
    }

    pub fn with_activities(self, items: Vec<ActivityItem>) -> Self {
        self.queue_activities(items);
        self
    }

    /// Queue activities for the next subscription.
    pub fn queue_activities(&self, items: Vec<ActivityItem>) {
        self.activities
            .lock()
            .expect("activities lock")
            .extend(items);
    }

    /// Keep the activity channel open after delivering all items, so only
    /// shutdown ends the subscription.
    pub fn keep_open(mut self) -> Self {
        self.keep_open = true;
        self
    }

    /// The shop scenario, application, and activities for the orchestrator.
    pub fn shop(items: Vec<ActivityItem>) -> Self {
        FakeApi::default()
            .with_scenario(SCENARIO_URL, scenario_fixture())
            .with_application(APPLICATION_URL, api_application_fixture())
            .with_activities(items)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn template(&self, url: &str) -> Option<ExperimentTemplate> {
        self.templates
            .lock()
            .expect("templates lock")
            .get(url)
            .cloned()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls lock").push(call);
    }
}

fn not_found(operation: &'static str, what: &str) -> Error {
    Error::remote(operation, format!("API error (404 Not Found): {what}"))
}

#[async_trait]
impl ExperimentsApi for FakeApi {
    async fn get_experiment_by_name(&self, name: &str) -> Result<ExperimentItem> {
        self.record(format!("get_experiment_by_name {name}"));
        self.experiments
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("get experiment", name))
    }

    async fn get_all_trials(&self, url: &str, query: &TrialListQuery) -> Result<TrialList> {
        let filter: Vec<String> = query
            .to_pairs()
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        self.record(format!("get_all_trials {}", filter.join("&")));
        let trials = self
            .trials
            .get(url)
            .ok_or_else(|| not_found("get trials", url))?
            .iter()
            .filter(|trial| {
                query.status.is_empty()
                    || trial
                        .status
                        .is_some_and(|status| query.status.contains(&status))
            })
            .cloned()
            .collect();
        Ok(TrialList { trials })
    }
}

#[async_trait]
impl ApplicationsApi for FakeApi {
    async fn subscribe_activity(
        &self,
        _query: &ActivityFeedQuery,
        _shutdown: Shutdown,
    ) -> Result<mpsc::Receiver<ActivityItem>> {
        self.record("subscribe_activity".to_string());
        let items = std::mem::take(&mut *self.activities.lock().expect("activities lock"));
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            tx.try_send(item).expect("channel sized for all items");
        }
        if self.keep_open {
            *self.held_sender.lock().expect("sender lock") = Some(tx);
        }
        Ok(rx)
    }

    async fn get_scenario(&self, url: &str) -> Result<Scenario> {
        self.record(format!("get_scenario {url}"));
        self.scenarios
            .get(url)
            .cloned()
            .ok_or_else(|| not_found("get scenario", url))
    }

    async fn get_application(&self, url: &str) -> Result<ApiApplication> {
        self.record(format!("get_application {url}"));
        self.applications
            .get(url)
            .cloned()
            .ok_or_else(|| not_found("get application", url))
    }

    async fn get_template(&self, url: &str) -> Result<ExperimentTemplate> {
        self.record(format!("get_template {url}"));
        self.template(url)
            .ok_or_else(|| not_found("get template", url))
    }

    async fn update_template(&self, url: &str, template: &ExperimentTemplate) -> Result<()> {
        self.record(format!("update_template {url}"));
        self.templates
            .lock()
            .expect("templates lock")
            .insert(url.to_string(), template.clone());
        Ok(())
    }
}

type ObjectKey = (String, Option<String>, String);

/// In-memory cluster keyed by kind, namespace, and name.
#[derive(Debug, Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<ObjectKey, Value>>,
    fail_get: Mutex<HashSet<String>>,
    fail_update: Mutex<HashSet<String>>,
    updates: Mutex<HashMap<String, usize>>,
    /// Where writes without `metadata.namespace` land, like kubectl's current
    /// context. `None` means `default`.
    context_namespace: Option<String>,
}

impl FakeCluster {
    pub fn in_context_namespace(namespace: &str) -> Self {
        Self {
            context_namespace: Some(namespace.to_string()),
            ..Self::default()
        }
    }

    /// Make `get` fail (not "absent") for every object of `kind`.
    pub fn fail_get(&self, kind: &str) {
        self.fail_get
            .lock()
            .expect("fail_get lock")
            .insert(kind.to_string());
    }

    pub fn fail_update(&self, kind: &str) {
        self.fail_update
            .lock()
            .expect("fail_update lock")
            .insert(kind.to_string());
    }

    pub fn stored(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<Value> {
        let key = (
            kind.to_string(),
            namespace.map(str::to_string),
            name.to_string(),
        );
        self.objects.lock().expect("objects lock").get(&key).cloned()
    }

    pub fn update_count(&self, kind: &str) -> usize {
        self.updates
            .lock()
            .expect("updates lock")
            .get(kind)
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().expect("objects lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn object_key(&self, object: &Value) -> ObjectKey {
        let doc = crate::core::manifest::Document::from_value(object.clone());
        let key = ResourceKey::from_document(&doc);
        let namespace = if key.namespace.is_some() && doc.namespace().is_none() {
            self.context_namespace.clone().or(key.namespace)
        } else {
            key.namespace
        };
        (key.kind.as_str().to_string(), namespace, key.name)
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn get(&self, key: &ResourceKey) -> anyhow::Result<Option<Value>> {
        if self
            .fail_get
            .lock()
            .expect("fail_get lock")
            .contains(key.kind.as_str())
        {
            bail!("connection refused");
        }
        let lookup = (
            key.kind.as_str().to_string(),
            key.namespace.clone(),
            key.name.clone(),
        );
        Ok(self
            .objects
            .lock()
            .expect("objects lock")
            .get(&lookup)
            .cloned())
    }

    async fn create(&self, object: &Value) -> anyhow::Result<()> {
        let key = self.object_key(object);
        let mut objects = self.objects.lock().expect("objects lock");
        if objects.contains_key(&key) {
            bail!("{} {} already exists", key.0, key.2);
        }
        objects.insert(key, object.clone());
        Ok(())
    }

    async fn update(&self, object: &Value) -> anyhow::Result<()> {
        let key = self.object_key(object);
        if self
            .fail_update
            .lock()
            .expect("fail_update lock")
            .contains(&key.0)
        {
            bail!("conflict");
        }
        *self
            .updates
            .lock()
            .expect("updates lock")
            .entry(key.0.clone())
            .or_default() += 1;
        let mut objects = self.objects.lock().expect("objects lock");
        if !objects.contains_key(&key) {
            bail!("{} {} not found", key.0, key.2);
        }
        objects.insert(key, object.clone());
        Ok(())
    }
}

/// Generator returning fixed bytes, or a fixed failure.
#[derive(Debug)]
pub struct StaticGenerator {
    output: std::result::Result<Vec<u8>, String>,
    calls: AtomicUsize,
}

impl StaticGenerator {
    pub fn new(output: Vec<u8>) -> Self {
        Self {
            output: Ok(output),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            output: Err(message.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Generator for StaticGenerator {
    fn generate(&self, _app: &Application) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.output.clone().map_err(|message| Error::Render {
            template: "generator".to_string(),
            message,
        })
    }
}
