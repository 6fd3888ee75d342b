//! Scan and Run activities driven through the orchestrator loop.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use trialctl::core::activity::Tag;
use trialctl::core::template::{Bounds, TemplateMetric, TemplateParameter};
use trialctl::deploy::DeployAction;
use trialctl::io::api::ApplicationsApi;
use trialctl::orchestrator::{ActivityOutcome, ActivityReport, Orchestrator};
use trialctl::shutdown;
use trialctl::test_support::{
    FakeApi, FakeCluster, StaticGenerator, TEMPLATE_URL, activity, generated_assets_yaml,
};

async fn drive(
    api: &Arc<FakeApi>,
    cluster: &Arc<FakeCluster>,
    generator: &Arc<StaticGenerator>,
) -> Vec<ActivityReport> {
    let orchestrator = Orchestrator::new(api.clone(), cluster.clone(), generator.clone());
    let (_trigger, shutdown) = shutdown::channel();
    let (tx, mut rx) = mpsc::channel(8);
    orchestrator.run(shutdown, tx).await.expect("run");

    let mut reports = Vec::new();
    while let Some(report) = rx.recv().await {
        reports.push(report);
    }
    reports
}

#[tokio::test]
async fn scan_then_run_deploys_union_of_generated_and_stored_template() {
    let api = Arc::new(FakeApi::shop(vec![activity("scan-1", vec![Tag::Scan])]));
    let cluster = Arc::new(FakeCluster::default());
    let generator = Arc::new(StaticGenerator::new(generated_assets_yaml().into_bytes()));

    let reports = drive(&api, &cluster, &generator).await;
    assert!(reports[0].is_success(), "{:?}", reports[0].error_messages());
    assert!(cluster.is_empty());

    // Someone edits the stored template between the scan and the run.
    let mut stored = api.template(TEMPLATE_URL).expect("stored template");
    stored.parameters[0].bounds = Some(Bounds { min: 2, max: 6 });
    stored.parameters.push(TemplateParameter {
        name: "memory".to_string(),
        bounds: Some(Bounds { min: 256, max: 2048 }),
        baseline: Some(json!(512)),
        ..TemplateParameter::default()
    });
    stored.metrics.push(TemplateMetric {
        name: "p95-latency".to_string(),
        minimize: true,
        query: Some("histogram_quantile(0.95, rate(latency_bucket[1m]))".to_string()),
    });
    api.update_template(TEMPLATE_URL, &stored)
        .await
        .expect("edit template");

    api.queue_activities(vec![activity("run-1", vec![Tag::Run])]);
    let reports = drive(&api, &cluster, &generator).await;

    let report = &reports[0];
    assert!(report.is_success(), "{:?}", report.error_messages());
    let Ok(ActivityOutcome::Ran { deploy, .. }) = &report.outcome else {
        panic!("expected a run outcome, got {:?}", report.outcome);
    };
    assert_eq!(deploy.outcomes.len(), 5);
    assert!(
        deploy
            .outcomes
            .iter()
            .all(|outcome| outcome.action == DeployAction::Created)
    );

    let experiment = cluster
        .stored("Experiment", Some("shop"), "shop-black-friday")
        .expect("experiment deployed");
    let parameters = experiment["spec"]["parameters"]
        .as_array()
        .expect("parameters");
    assert_eq!(parameters.len(), 2);
    assert_eq!(parameters[0]["name"], json!("replicas"));
    assert_eq!(parameters[0]["min"], json!(2));
    assert_eq!(parameters[0]["max"], json!(6));
    assert_eq!(parameters[1]["name"], json!("memory"));
    assert_eq!(parameters[1]["baseline"], json!(512));

    let metrics: Vec<&str> = experiment["spec"]["metrics"]
        .as_array()
        .expect("metrics")
        .iter()
        .filter_map(|metric| metric["name"].as_str())
        .collect();
    assert_eq!(metrics, vec!["cost", "p95-latency"]);
    assert!(experiment["spec"]["patches"].is_array());
}

#[tokio::test]
async fn repeated_run_upserts_without_errors() {
    let api = Arc::new(FakeApi::shop(vec![
        activity("scan-1", vec![Tag::Scan]),
        activity("run-1", vec![Tag::Run]),
        activity("run-2", vec![Tag::Run]),
    ]));
    let cluster = Arc::new(FakeCluster::default());
    let generator = Arc::new(StaticGenerator::new(generated_assets_yaml().into_bytes()));

    let reports = drive(&api, &cluster, &generator).await;

    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(ActivityReport::is_success));
    assert_eq!(cluster.update_count("ConfigMap"), 1);
    assert_eq!(cluster.update_count("Experiment"), 1);
    assert_eq!(cluster.update_count("ServiceAccount"), 0);
    assert_eq!(cluster.len(), 5);
}

#[tokio::test]
async fn run_without_stored_template_is_reported_and_skipped() {
    let api = Arc::new(FakeApi::shop(vec![
        activity("run-1", vec![Tag::Run]),
        activity("bogus", Vec::new()),
    ]));
    let cluster = Arc::new(FakeCluster::default());
    let generator = Arc::new(StaticGenerator::new(generated_assets_yaml().into_bytes()));

    let reports = drive(&api, &cluster, &generator).await;

    assert_eq!(reports.len(), 2);
    assert!(reports[0].error_messages()[0].contains("404"));
    assert!(reports[1].error_messages()[0].contains("expected 1 got 0"));
    assert_eq!(reports[1].summary().tag, None);
    assert!(cluster.is_empty());
}
