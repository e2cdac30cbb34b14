//! One tick of the control loop: reap finished workers, then elect and
//! launch this tick's backups.

use std::time::Duration;

use chrono::Utc;
use kube::Client;
use serde_json::json;
use tracing::{error, warn};

use crate::candidates::{self, VolumeMode};
use crate::config::Config;
use crate::error::Result;
use crate::k8s;
use crate::launcher;
use crate::metadata::{render_date, ANNOTATION_LAST_ATTEMPT};
use crate::rbd::RbdClient;
use crate::reaper;
use crate::scheduler;

/// Upper bound on one tick; the external scheduler runs the next one.
pub const TICK_DEADLINE: Duration = Duration::from_secs(3600);

/// Runs a tick. One volume failing must not keep the rest of the batch
/// from being attempted, so per-volume errors are logged and swallowed;
/// only fleet-level failures (listing, reaping) abort the tick.
pub async fn run(client: &Client, config: &Config, cleanup_only: bool) -> Result<()> {
    let now = Utc::now().naive_utc();
    let rbd = RbdClient::new();

    let in_flight = reaper::cleanup_jobs(client, &rbd, config).await?;
    if cleanup_only {
        return Ok(());
    }

    let candidates = candidates::list_candidates(client, &config.namespace).await?;
    let selected = scheduler::select(candidates, now, &in_flight);

    for candidate in &selected {
        match candidate.mode {
            VolumeMode::Filesystem | VolumeMode::Block => {
                if let Err(e) = launcher::launch(client, &rbd, config, candidate, now).await {
                    error!("Backup of {} failed: {}", candidate.pv, e);
                }
            }
            VolumeMode::Unknown(ref mode) => {
                warn!("Unsupported volume mode {:?}", mode);
                // Annotate the PV anyway so the cadence counter advances
                // and the volume does not clog the due list.
                if let Err(e) = k8s::annotate_volume(
                    client,
                    &candidate.pv,
                    json!({ ANNOTATION_LAST_ATTEMPT: render_date(now) }),
                )
                .await
                {
                    error!("Failed to annotate {}: {}", candidate.pv, e);
                }
            }
        }
    }

    Ok(())
}
