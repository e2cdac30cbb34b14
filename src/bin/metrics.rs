//! Metrics exporter: serves Prometheus metrics derived from the fleet
//! state, or prints the candidate table and exits.

use std::path::PathBuf;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use ceph_backup::{candidates, k8s, metadata, metrics, table, Error};
use clap::Parser;
use kube::Client;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "ceph-backup-metrics",
    about = "Expose metrics from ceph-backup operations"
)]
struct Args {
    /// Path to a kubeconfig file (defaults to in-cluster configuration)
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Print the candidate table and exit
    #[arg(long)]
    table: bool,
}

#[derive(Clone)]
struct AppState {
    client: Client,
    namespace: String,
}

async fn serve_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match metrics::collect(&state.client, &state.namespace).await {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        ),
        Err(e) => {
            error!("Metrics collection failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                String::new(),
            )
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();

    let args = Args::parse();
    let namespace = metadata::reserved_namespace();
    let client = k8s::make_client(args.kubeconfig.as_deref()).await?;

    if args.table {
        let candidates = candidates::list_candidates(&client, &namespace).await?;
        let jobs = k8s::list_worker_jobs(&client, &namespace).await?;
        println!("{}", table::candidate_table(&candidates, &jobs));
        return Ok(());
    }

    let app = Router::new()
        .route("/metrics", get(serve_metrics))
        .with_state(AppState { client, namespace });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", 8080)).await?;
    info!("Serving metrics on 0.0.0.0:8080");
    axum::serve(listener, app).await?;
    Ok(())
}
