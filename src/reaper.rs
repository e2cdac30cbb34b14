//! Reaps finished worker jobs: propagates success to the claim, reclaims
//! snapshot/clone storage and the orchestrator artifacts bound to the
//! job, then seals the job so the next tick skips it.
//!
//! Step order is load-bearing. The claim annotation is written before
//! storage reclamation so a crash in between still leaves provenance;
//! `cleaned-up` is written last so a crash re-runs the (idempotent)
//! reclamation on the next tick.

use std::collections::HashMap;

use k8s_openapi::api::batch::v1::Job;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::k8s;
use crate::metadata::{
    ANNOTATION_CLEANED_UP, ANNOTATION_LAST_BACKUP, ANNOTATION_START_TIME, LABEL_PVC_NAME,
    LABEL_PVC_NAMESPACE, LABEL_PV_NAME, LABEL_RBD_NAME, LABEL_RBD_POOL,
};
use crate::rbd::{self, RbdClient};

/// Sealed jobs stick around for a day before the platform removes them.
const SEALED_JOB_TTL_SECONDS: i32 = 23 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// The job has not reached a completed status; its volume stays
    /// gated against new launches.
    InFlight,
    Completed {
        successful: bool,
    },
}

/// True iff a `Failed` condition fired. Both the condition type and its
/// status are compared case-insensitively.
pub fn failed_condition(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.type_.eq_ignore_ascii_case("failed") && c.status.eq_ignore_ascii_case("true")
            })
        })
        .unwrap_or(false)
}

/// A job is completed once its completion time is set or a `Failed`
/// condition fired; it is successful unless the latter happened.
pub fn classify(job: &Job) -> JobState {
    let failed = failed_condition(job);
    let completed = failed
        || job
            .status
            .as_ref()
            .and_then(|s| s.completion_time.as_ref())
            .is_some();
    if completed {
        JobState::Completed {
            successful: !failed,
        }
    } else {
        JobState::InFlight
    }
}

pub fn is_cleaned_up(job: &Job) -> bool {
    job.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_CLEANED_UP))
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// The claim's `last-backup` is advanced only forward, never regressed.
/// An unparseable existing value is treated as absent.
pub fn needs_last_backup_update(existing: Option<&str>, start_time: &str) -> bool {
    let Ok(start) = crate::metadata::parse_date(start_time) else {
        return false;
    };
    match existing.and_then(|e| crate::metadata::parse_date(e).ok()) {
        Some(existing) => existing < start,
        None => true,
    }
}

/// The label set a worker job carries, linking it to the artifacts it
/// owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLabels {
    pub pv: String,
    pub pvc_namespace: String,
    pub pvc_name: String,
    pub rbd_pool: String,
    pub rbd_name: String,
}

impl WorkerLabels {
    pub fn from_job(job: &Job) -> Option<WorkerLabels> {
        let labels = job.metadata.labels.as_ref()?;
        Some(WorkerLabels {
            pv: labels.get(LABEL_PV_NAME)?.clone(),
            pvc_namespace: labels.get(LABEL_PVC_NAMESPACE)?.clone(),
            pvc_name: labels.get(LABEL_PVC_NAME)?.clone(),
            rbd_pool: labels.get(LABEL_RBD_POOL)?.clone(),
            rbd_name: labels.get(LABEL_RBD_NAME)?.clone(),
        })
    }
}

/// Processes every worker job in the reserved namespace. Returns the
/// in-flight map (`pv -> job name`) gating this tick's launches; a job
/// whose reclamation failed keeps its volume gated as well.
pub async fn cleanup_jobs(
    client: &Client,
    rbd: &RbdClient,
    config: &Config,
) -> Result<HashMap<String, String>> {
    let jobs = k8s::list_worker_jobs(client, &config.namespace).await?;
    let mut in_flight = HashMap::new();

    for job in &jobs {
        let job_name = job.name_any();
        let Some(labels) = WorkerLabels::from_job(job) else {
            warn!("Worker job {} is missing backup labels, skipping", job_name);
            continue;
        };

        match classify(job) {
            JobState::InFlight => {
                in_flight.insert(labels.pv.clone(), job_name);
            }
            JobState::Completed { successful } => {
                if is_cleaned_up(job) {
                    continue;
                }
                info!(
                    "Cleaning up job={} pv={}, pvc={}/{}",
                    job_name, labels.pv, labels.pvc_namespace, labels.pvc_name,
                );
                if let Err(e) = cleanup_job(client, rbd, config, job, &labels, successful).await {
                    warn!(
                        "Cleanup of job {} failed, keeping volume {} gated: {}",
                        job_name, labels.pv, e,
                    );
                    in_flight.insert(labels.pv.clone(), job_name);
                }
            }
        }
    }

    Ok(in_flight)
}

async fn cleanup_job(
    client: &Client,
    rbd: &RbdClient,
    config: &Config,
    job: &Job,
    labels: &WorkerLabels,
    successful: bool,
) -> Result<()> {
    let start_time = job
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_START_TIME));

    // Propagate success to the claim first: a crash below leaves the
    // provenance in place and the reclamation re-runs next tick.
    if successful {
        if let Some(start_time) = start_time {
            match k8s::get_claim(client, &labels.pvc_namespace, &labels.pvc_name).await? {
                Some(claim) => {
                    let existing = claim
                        .metadata
                        .annotations
                        .as_ref()
                        .and_then(|a| a.get(ANNOTATION_LAST_BACKUP))
                        .map(String::as_str);
                    if needs_last_backup_update(existing, start_time) {
                        k8s::annotate_claim(
                            client,
                            &labels.pvc_namespace,
                            &labels.pvc_name,
                            json!({ ANNOTATION_LAST_BACKUP: start_time }),
                        )
                        .await?;
                    }
                }
                None => debug!(
                    "Claim {}/{} is gone, skipping last-backup annotation",
                    labels.pvc_namespace, labels.pvc_name,
                ),
            }
        } else {
            warn!(
                "Job {} has no start-time annotation, cannot update claim",
                job.name_any(),
            );
        }
    }

    // Reclaim the snapshot and cloned image.
    let clone = rbd::fq_backup_image(&labels.rbd_pool, &labels.rbd_name);
    let snapshot = rbd::fq_snapshot(&labels.rbd_pool, &labels.rbd_name);
    if rbd.exists(&clone).await? {
        rbd.rm(&clone).await?;
    }
    if rbd.exists(&snapshot).await? {
        if let Err(e) = rbd.snap_unprotect(&snapshot).await {
            debug!("snap unprotect of {} failed: {}", snapshot, e);
        }
        rbd.snap_rm(&snapshot).await?;
    }

    // Reclaim the bound claim / volume / config map plumbing.
    k8s::delete_labeled_artifacts(client, &config.namespace, &labels.pv).await?;

    // Seal last: re-running everything above is idempotent.
    k8s::patch_job(
        client,
        &config.namespace,
        &job.name_any(),
        json!({
            "metadata": { "annotations": { ANNOTATION_CLEANED_UP: "true" } },
            "spec": { "ttlSecondsAfterFinished": SEALED_JOB_TTL_SECONDS },
        }),
    )
    .await?;

    Ok(())
}
