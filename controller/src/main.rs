//! Activity controller - runs the orchestrator loop and exposes its progress.

mod reports;
mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use clap::Parser;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use trialctl::io::api::HttpApi;
use trialctl::io::cluster::KubectlCluster;
use trialctl::io::config::{DEFAULT_CONFIG_PATH, load_config};
use trialctl::io::generator::CommandGenerator;
use trialctl::orchestrator::Orchestrator;
use trialctl::shutdown::ShutdownTrigger;
use trialctl::{logging, shutdown};

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "trialctl-controller")]
#[command(about = "Deploy experiments in response to application activity")]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the API server address
    #[arg(long)]
    address: Option<String>,

    /// Address to bind the status server to (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init("trialctl=info,trialctl_controller=info");

    let args = Args::parse();
    let cfg = load_config(&args.config)?.with_address(args.address);

    let api = HttpApi::new(&cfg.api, &cfg.controller).context("build API client")?;
    let cluster = KubectlCluster::new(&cfg.kubectl);
    let generator = CommandGenerator::new(cfg.generator.clone());
    let orchestrator = Orchestrator::new(Arc::new(api), Arc::new(cluster), Arc::new(generator));

    let (trigger, shutdown) = shutdown::channel();
    let trigger = Arc::new(trigger);
    let state = AppState::new(shutdown.clone(), cfg.controller.report_buffer);

    let (report_tx, report_rx) = mpsc::channel(cfg.controller.report_buffer.max(1));
    let orchestrator_task = tokio::spawn({
        let shutdown = shutdown.clone();
        let trigger = trigger.clone();
        async move { run_until_stopped(orchestrator.run(shutdown, report_tx), &trigger).await }
    });
    let reports_task = tokio::spawn(reports::consume_reports(state.clone(), report_rx));

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received");
                trigger.trigger();
            }
            Err(err) => warn!(error = %err, "cannot listen for interrupts"),
        }
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_router())
        .route("/events", get(sse::events_handler))
        .layer(cors)
        .with_state(state);

    let bind = args.bind.unwrap_or(cfg.controller.bind);
    let port = args.port.unwrap_or(cfg.controller.port);
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {bind}:{port}"))?;
    info!(addr = %addr, api = %cfg.api.address, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let mut server_shutdown = shutdown;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.wait().await })
        .await?;

    let loop_result = orchestrator_task.await.context("join orchestrator")?;
    reports_task.await.context("join report consumer")?;
    loop_result?;
    info!("controller stopped");
    Ok(())
}

/// Await the activity loop, then stop the server whatever its outcome.
async fn run_until_stopped(
    run: impl Future<Output = trialctl::error::Result<()>>,
    trigger: &ShutdownTrigger,
) -> anyhow::Result<()> {
    let outcome = run.await;
    if let Err(err) = &outcome {
        error!(error = %err, "orchestrator stopped");
    }
    trigger.trigger();
    outcome.context("activity loop failed")
}
