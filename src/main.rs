//! Tick entry point: one invocation reaps finished workers and launches
//! this tick's backups.

use std::path::PathBuf;

use ceph_backup::config::Config;
use ceph_backup::{k8s, tick, Error};
use clap::Parser;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ceph-backup", about = "Back up Ceph RBD volumes on a Kubernetes cluster")]
struct Args {
    /// Path to a kubeconfig file (defaults to in-cluster configuration)
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Only reap finished worker jobs; do not launch new backups
    #[arg(long)]
    cleanup_only: bool,
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
    let config = Config::from_env()?;
    let client = k8s::make_client(args.kubeconfig.as_deref()).await?;

    match tokio::time::timeout(
        tick::TICK_DEADLINE,
        tick::run(&client, &config, args.cleanup_only),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(Error::DeadlineExceeded),
    }
}
