//! Launches one backup: materializes a crash-consistent clone of the
//! source image and wires it into a worker job.
//!
//! Both modes share a preamble whose order is strict: stale artifacts
//! from a crashed prior tick are removed, the attempt is recorded on the
//! volume, then snapshot / protect / clone. File-tree volumes mount the
//! clone read-only and stream files; raw-block volumes get a bound
//! claim onto the clone and stream a qcow2 image from the raw device.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, Container, EnvVar, EnvVarSource, LocalObjectReference,
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, PodAffinityTerm, PodAntiAffinity,
    PodSpec, PodTemplateSpec, RBDPersistentVolumeSource, RBDVolumeSource, SecretKeySelector,
    SecretReference, SecretVolumeSource, Volume, VolumeDevice, VolumeMount,
    VolumeResourceRequirements, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{info, warn};

use crate::candidates::{Candidate, VolumeMode};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::k8s;
use crate::metadata::{
    render_date, ANNOTATION_LAST_ATTEMPT, ANNOTATION_START_TIME, LABEL_PVC_NAME,
    LABEL_PVC_NAMESPACE, LABEL_PV_NAME, LABEL_RBD_NAME, LABEL_RBD_POOL, LABEL_VOLUME_MODE,
    LABEL_VOLUME_TYPE,
};
use crate::rbd::{self, RbdClient};

/// Workers that have not finished after 12 hours are killed.
const WORKER_DEADLINE_SECONDS: i64 = 12 * 3600;

/// Env value for a worker container: either a literal or a reference
/// into a named secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    Literal(String),
    SecretRef { name: String, key: String },
}

fn env_var(name: &str, value: EnvValue) -> EnvVar {
    match value {
        EnvValue::Literal(value) => EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        },
        EnvValue::SecretRef { name: secret, key } => EnvVar {
            name: name.to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: Some(secret),
                    key,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    }
}

fn mode_label(mode: &VolumeMode) -> &'static str {
    match mode {
        VolumeMode::Block => "block",
        _ => "filesystem",
    }
}

/// Stable host identifier recorded in the backup repository, so re-runs
/// for the same claim land in the same history.
pub fn host_token(candidate: &Candidate) -> String {
    let mode = match candidate.mode {
        VolumeMode::Block => "block",
        _ => "fs",
    };
    format!("rbd-{}-{}-nspvc-{}", mode, candidate.namespace, candidate.name)
}

/// The full label set carried by the worker job, its pod, and every
/// bound artifact. The reaper's selectors depend on it.
pub fn backup_labels(candidate: &Candidate) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_VOLUME_TYPE.to_string(), "rbd".to_string());
    labels.insert(
        LABEL_VOLUME_MODE.to_string(),
        mode_label(&candidate.mode).to_string(),
    );
    labels.insert(LABEL_PV_NAME.to_string(), candidate.pv.clone());
    labels.insert(LABEL_PVC_NAMESPACE.to_string(), candidate.namespace.clone());
    labels.insert(LABEL_PVC_NAME.to_string(), candidate.name.clone());
    labels.insert(LABEL_RBD_POOL.to_string(), candidate.rbd_pool.clone());
    labels.insert(LABEL_RBD_NAME.to_string(), candidate.rbd_name.clone());
    labels
}

/// Name shared by the bound volume, its claim and (suffixed) the layout
/// config map in the reserved namespace.
pub fn clone_artifact_name(candidate: &Candidate) -> String {
    format!("backup-{}", candidate.pv)
}

/// Prefer spreading workers across nodes so one host does not carry
/// every backup mount.
fn worker_anti_affinity() -> Affinity {
    let mut match_labels = BTreeMap::new();
    match_labels.insert(LABEL_VOLUME_TYPE.to_string(), "rbd".to_string());
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 50,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(LabelSelector {
                            match_labels: Some(match_labels),
                            ..Default::default()
                        }),
                        topology_key: "kubernetes.io/hostname".to_string(),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn restic_env(config: &Config, candidate: &Candidate) -> Vec<EnvVar> {
    vec![
        env_var(
            "URL",
            EnvValue::SecretRef {
                name: config.restic_secret_name.clone(),
                key: "url".to_string(),
            },
        ),
        env_var("HOST", EnvValue::Literal(host_token(candidate))),
        env_var(
            "RESTIC_PASSWORD",
            EnvValue::SecretRef {
                name: config.restic_secret_name.clone(),
                key: "password".to_string(),
            },
        ),
    ]
}

fn job_metadata(
    config: &Config,
    candidate: &Candidate,
    now: NaiveDateTime,
    name_prefix: &str,
) -> ObjectMeta {
    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_START_TIME.to_string(), render_date(now));
    ObjectMeta {
        generate_name: Some(format!("{}-{}-", name_prefix, candidate.namespace)),
        namespace: Some(config.namespace.clone()),
        labels: Some(backup_labels(candidate)),
        annotations: Some(annotations),
        ..Default::default()
    }
}

fn job_spec(labels: BTreeMap<String, String>, pod_spec: PodSpec) -> JobSpec {
    JobSpec {
        active_deadline_seconds: Some(WORKER_DEADLINE_SECONDS),
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                ..Default::default()
            }),
            spec: Some(pod_spec),
        },
        ..Default::default()
    }
}

/// Worker job for a file-tree volume: the clone is mounted read-only at
/// /data and streamed file by file.
pub fn build_fs_job(config: &Config, candidate: &Candidate, now: NaiveDateTime) -> Job {
    let pod_spec = PodSpec {
        restart_policy: Some("Never".to_string()),
        affinity: Some(worker_anti_affinity()),
        containers: vec![Container {
            name: "backup".to_string(),
            image: Some(config.backup_image.clone()),
            image_pull_policy: Some(config.backup_image_pull_policy.clone()),
            args: Some(
                [
                    "/opt/restic",
                    "-r",
                    "$(URL)",
                    "--host",
                    "$(HOST)",
                    "--exclude",
                    "lost+found",
                    "backup",
                    "/data",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ),
            env: Some(restic_env(config, candidate)),
            volume_mounts: Some(vec![VolumeMount {
                name: "data".to_string(),
                mount_path: "/data".to_string(),
                read_only: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        }],
        volumes: Some(vec![Volume {
            name: "data".to_string(),
            rbd: Some(RBDVolumeSource {
                monitors: config.ceph.monitors.clone(),
                pool: Some(candidate.rbd_pool.clone()),
                image: rbd::backup_image(&candidate.rbd_name),
                fs_type: candidate.fstype.clone(),
                secret_ref: Some(LocalObjectReference {
                    name: Some(config.ceph.secret_name.clone()),
                }),
                user: Some(config.ceph.user.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Job {
        metadata: job_metadata(config, candidate, now, "backup-rbd-fs"),
        spec: Some(job_spec(backup_labels(candidate), pod_spec)),
        ..Default::default()
    }
}

/// Worker job for a raw-block volume: the clone appears as a raw device
/// at /disk via the bound claim; the pipeline regenerates the allocation
/// layout, converts the device to qcow2 and streams it to the
/// repository on stdin.
pub fn build_block_job(config: &Config, candidate: &Candidate, now: NaiveDateTime) -> Job {
    let clone = rbd::fq_backup_image(&candidate.rbd_pool, &candidate.rbd_name);
    let pipeline = format!(
        "rbd diff --whole-object --format=json {clone} > /tmp/layout.json && \
         streaming-qcow2-writer /disk /tmp/layout.json | \
         /opt/restic -r $(URL) --host $(HOST) backup --stdin --stdin-filename disk.qcow2",
    );

    let pod_spec = PodSpec {
        restart_policy: Some("Never".to_string()),
        affinity: Some(worker_anti_affinity()),
        containers: vec![Container {
            name: "backup".to_string(),
            image: Some(config.backup_image.clone()),
            image_pull_policy: Some(config.backup_image_pull_policy.clone()),
            command: Some(vec!["sh".to_string(), "-c".to_string(), pipeline]),
            env: Some(restic_env(config, candidate)),
            volume_devices: Some(vec![VolumeDevice {
                name: "data".to_string(),
                device_path: "/disk".to_string(),
            }]),
            volume_mounts: Some(vec![VolumeMount {
                name: "ceph-key".to_string(),
                mount_path: "/var/run/secrets/ceph".to_string(),
                read_only: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        }],
        volumes: Some(vec![
            Volume {
                name: "data".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: clone_artifact_name(candidate),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: "ceph-key".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(config.ceph.key_secret_name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    Job {
        metadata: job_metadata(config, candidate, now, "backup-rbd-block"),
        spec: Some(job_spec(backup_labels(candidate), pod_spec)),
        ..Default::default()
    }
}

/// Static PersistentVolume exposing the clone image, pre-bound by name
/// to the claim in the reserved namespace.
pub fn build_clone_volume(config: &Config, candidate: &Candidate, size: &str) -> PersistentVolume {
    let mut capacity = BTreeMap::new();
    capacity.insert("storage".to_string(), Quantity(size.to_string()));

    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(clone_artifact_name(candidate)),
            labels: Some(backup_labels(candidate)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            capacity: Some(capacity),
            claim_ref: Some(k8s_openapi::api::core::v1::ObjectReference {
                namespace: Some(config.namespace.clone()),
                name: Some(clone_artifact_name(candidate)),
                ..Default::default()
            }),
            persistent_volume_reclaim_policy: Some("Retain".to_string()),
            volume_mode: Some("Block".to_string()),
            rbd: Some(RBDPersistentVolumeSource {
                monitors: config.ceph.monitors.clone(),
                pool: Some(candidate.rbd_pool.clone()),
                image: rbd::backup_image(&candidate.rbd_name),
                user: Some(config.ceph.user.clone()),
                secret_ref: Some(SecretReference {
                    name: Some(config.ceph.secret_name.clone()),
                    namespace: Some(config.namespace.clone()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_clone_claim(
    config: &Config,
    candidate: &Candidate,
    size: &str,
) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(size.to_string()));

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(clone_artifact_name(candidate)),
            namespace: Some(config.namespace.clone()),
            labels: Some(backup_labels(candidate)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            volume_mode: Some("Block".to_string()),
            volume_name: Some(clone_artifact_name(candidate)),
            // Empty class keeps the provisioner away from this claim.
            storage_class_name: Some(String::new()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Allocation layout of the clone, captured at launch time. The clone
/// never changes afterwards, so this matches what the worker sees.
pub fn build_layout_config_map(
    candidate: &Candidate,
    diff_json: &[u8],
) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert(
        "layout.json".to_string(),
        String::from_utf8_lossy(diff_json).into_owned(),
    );
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(format!("{}-layout", clone_artifact_name(candidate))),
            labels: Some(backup_labels(candidate)),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Runs the full launch sequence for one volume.
pub async fn launch(
    client: &Client,
    rbd: &RbdClient,
    config: &Config,
    candidate: &Candidate,
    now: NaiveDateTime,
) -> Result<()> {
    info!(
        "Backing up: pv={}, pvc={}/{}, rbd={}/{}, mode={}, size={}",
        candidate.pv,
        candidate.namespace,
        candidate.name,
        candidate.rbd_pool,
        candidate.rbd_name,
        mode_label(&candidate.mode),
        candidate.size.as_deref().unwrap_or("unknown"),
    );

    let fq_snapshot = rbd::fq_snapshot(&candidate.rbd_pool, &candidate.rbd_name);
    let fq_clone = rbd::fq_backup_image(&candidate.rbd_pool, &candidate.rbd_name);

    // Stale artifacts from a crashed prior tick.
    if rbd.exists(&fq_clone).await? {
        rbd.rm(&fq_clone).await?;
    }
    if rbd.exists(&fq_snapshot).await? {
        if let Err(e) = rbd.snap_unprotect(&fq_snapshot).await {
            warn!("snap unprotect of {} failed: {}", fq_snapshot, e);
        }
        rbd.snap_rm(&fq_snapshot).await?;
    }

    // Record the attempt before it begins.
    k8s::annotate_volume(
        client,
        &candidate.pv,
        json!({ ANNOTATION_LAST_ATTEMPT: render_date(now) }),
    )
    .await?;

    // Crash-consistent point-in-time clone. Cloning (rather than
    // mounting the snapshot) lets the filesystem be repaired on mount
    // if the image was in use when snapshotted.
    rbd.snap_create(&fq_snapshot).await?;
    rbd.snap_protect(&fq_snapshot).await?;
    rbd.clone(&fq_snapshot, &fq_clone).await?;

    match candidate.mode {
        VolumeMode::Filesystem => {
            let job =
                k8s::create_job(client, &config.namespace, &build_fs_job(config, candidate, now))
                    .await?;
            info!("Created job {}", job.name_any());
        }
        VolumeMode::Block => {
            let size = candidate
                .size
                .clone()
                .ok_or_else(|| Error::MissingCapacity(candidate.pv.clone()))?;
            k8s::create_volume(client, &build_clone_volume(config, candidate, &size)).await?;
            k8s::create_claim(
                client,
                &config.namespace,
                &build_clone_claim(config, candidate, &size),
            )
            .await?;
            let diff = rbd.diff_json(&fq_clone).await?;
            k8s::create_config_map(
                client,
                &config.namespace,
                &build_layout_config_map(candidate, &diff),
            )
            .await?;
            let job = k8s::create_job(
                client,
                &config.namespace,
                &build_block_job(config, candidate, now),
            )
            .await?;
            info!("Created job {}", job.name_any());
        }
        VolumeMode::Unknown(ref mode) => {
            // The tick driver filters these out before the preamble.
            warn!("Unsupported volume mode {:?} for {}", mode, candidate.pv);
        }
    }

    Ok(())
}
