//! Observability signals derived from the same fleet state the
//! controller schedules from.
//!
//! Derivation is a pure function of (candidates, jobs, cron jobs, now);
//! the exporter rebuilds the registry on every scrape so the values
//! always reflect the cluster, never process-local state.

use std::collections::BTreeMap;

use chrono::{NaiveDateTime, Utc};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use kube::{Client, ResourceExt};
use prometheus_client::encoding::{text, EncodeLabelSet};
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::candidates::{self, Candidate};
use crate::error::{Error, Result};
use crate::k8s;
use crate::metadata::LABEL_PVC_NAMESPACE;
use crate::reaper;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NamespaceLabels {
    pub namespace: String,
}

/// Per-namespace tallies. Due buckets span 0..24 hours (never-backed-up
/// maps to 0), age buckets 0..36 hours; the top bucket of each absorbs
/// everything beyond the range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceStats {
    pub volumes: u64,
    pub never_backed_up: u64,
    pub due: [u64; 25],
    pub age: [u64; 37],
    pub running_jobs: u64,
    pub failed_jobs: u64,
}

impl Default for NamespaceStats {
    fn default() -> NamespaceStats {
        NamespaceStats {
            volumes: 0,
            never_backed_up: 0,
            due: [0; 25],
            age: [0; 37],
            running_jobs: 0,
            failed_jobs: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetStats {
    pub namespaces: BTreeMap<String, NamespaceStats>,
    pub failed_crons: u64,
}

/// Hours until the next attempt is due, assuming a 24h cadence.
fn due_bucket(last_attempt: Option<NaiveDateTime>, now: NaiveDateTime) -> usize {
    match last_attempt {
        None => 0,
        Some(last_attempt) => {
            let seconds = (last_attempt - now).num_seconds() + 24 * 3600;
            let d = seconds.div_euclid(3600);
            let r = seconds.rem_euclid(3600);
            let div_ceil = if r > 0 { d + 1 } else { d };
            div_ceil.clamp(0, 24) as usize
        }
    }
}

/// Whole hours since the last successful backup.
fn age_bucket(last_backup: NaiveDateTime, now: NaiveDateTime) -> usize {
    let hours = (now - last_backup).num_seconds().max(0) / 3600;
    hours.min(36) as usize
}

fn is_running(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.active)
        .unwrap_or(0)
        > 0
}

/// True for jobs spawned by one of the controller's CronJobs.
fn owned_by_cron(job: &Job, cron_names: &[String]) -> bool {
    job.metadata
        .owner_references
        .as_ref()
        .map(|refs| {
            refs.iter()
                .any(|r| r.kind == "CronJob" && cron_names.contains(&r.name))
        })
        .unwrap_or(false)
}

/// Folds the fleet snapshot into labeled tallies. `jobs` is every job
/// in the reserved namespace; worker jobs are told apart by their
/// claim-namespace label.
pub fn derive(
    candidates: &[Candidate],
    jobs: &[Job],
    cron_jobs: &[CronJob],
    now: NaiveDateTime,
) -> FleetStats {
    let mut stats = FleetStats::default();

    for candidate in candidates {
        let entry = stats
            .namespaces
            .entry(candidate.namespace.clone())
            .or_default();
        entry.volumes += 1;
        if candidate.last_backup.is_none() {
            entry.never_backed_up += 1;
        }
        entry.due[due_bucket(candidate.last_attempt, now)] += 1;
        if let Some(last_backup) = candidate.last_backup {
            entry.age[age_bucket(last_backup, now)] += 1;
        }
    }

    let cron_names: Vec<String> = cron_jobs.iter().map(|c| c.name_any()).collect();
    for job in jobs {
        let worker_namespace = job
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_PVC_NAMESPACE));
        match worker_namespace {
            Some(namespace) => {
                let entry = stats.namespaces.entry(namespace.clone()).or_default();
                if is_running(job) {
                    entry.running_jobs += 1;
                }
                if reaper::failed_condition(job) {
                    entry.failed_jobs += 1;
                }
            }
            None => {
                if owned_by_cron(job, &cron_names) && reaper::failed_condition(job) {
                    stats.failed_crons += 1;
                }
            }
        }
    }

    stats
}

/// Renders the tallies in Prometheus text format.
pub fn encode(stats: &FleetStats) -> Result<String> {
    let mut registry = Registry::default();

    let volumes_backed_up = Family::<NamespaceLabels, Gauge>::default();
    registry.register(
        "volumes_backed_up",
        "Volumes that have backups enabled",
        volumes_backed_up.clone(),
    );
    let never_backed_up = Family::<NamespaceLabels, Gauge>::default();
    registry.register(
        "volume_never_backed_up",
        "Volumes that have never completed a backup",
        never_backed_up.clone(),
    );
    let backups_due = Family::<NamespaceLabels, Histogram>::new_with_constructor(|| {
        Histogram::new((0..24).map(f64::from))
    });
    registry.register(
        "volume_backups_due",
        "Volume backups by due date (in hours)",
        backups_due.clone(),
    );
    let backup_age = Family::<NamespaceLabels, Histogram>::new_with_constructor(|| {
        Histogram::new((0..36).map(f64::from))
    });
    registry.register(
        "volume_backup_age",
        "Age of the last successful backup (in hours)",
        backup_age.clone(),
    );
    let running_jobs = Family::<NamespaceLabels, Gauge>::default();
    registry.register(
        "running_backup_jobs",
        "Number of backup jobs running now",
        running_jobs.clone(),
    );
    let failed_jobs = Family::<NamespaceLabels, Gauge>::default();
    registry.register(
        "failed_backup_jobs",
        "Number of backup jobs that failed",
        failed_jobs.clone(),
    );
    let failed_crons: Gauge<i64, std::sync::atomic::AtomicI64> = Gauge::default();
    registry.register(
        "failed_backup_crons",
        "Controller cron jobs that failed",
        failed_crons.clone(),
    );

    for (namespace, s) in &stats.namespaces {
        let labels = NamespaceLabels {
            namespace: namespace.clone(),
        };
        volumes_backed_up.get_or_create(&labels).set(s.volumes as i64);
        never_backed_up
            .get_or_create(&labels)
            .set(s.never_backed_up as i64);
        running_jobs.get_or_create(&labels).set(s.running_jobs as i64);
        failed_jobs.get_or_create(&labels).set(s.failed_jobs as i64);

        let due = backups_due.get_or_create(&labels);
        for (bucket, count) in s.due.iter().enumerate() {
            for _ in 0..*count {
                due.observe(bucket as f64);
            }
        }
        let age = backup_age.get_or_create(&labels);
        for (bucket, count) in s.age.iter().enumerate() {
            for _ in 0..*count {
                age.observe(bucket as f64);
            }
        }
    }
    failed_crons.set(stats.failed_crons as i64);

    let mut out = String::new();
    text::encode(&mut out, &registry).map_err(|_| Error::MetricsEncode)?;
    Ok(out)
}

/// One scrape: fetch fleet state, derive, render.
pub async fn collect(client: &Client, namespace: &str) -> Result<String> {
    let now = Utc::now().naive_utc();
    let (candidates, jobs, cron_jobs) = tokio::try_join!(
        candidates::list_candidates(client, namespace),
        k8s::list_jobs(client, namespace),
        k8s::list_cron_jobs(client, namespace),
    )?;
    encode(&derive(&candidates, &jobs, &cron_jobs, now))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate};
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    use super::*;
    use crate::candidates::VolumeMode;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 15)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn candidate(
        namespace: &str,
        last_attempt: Option<NaiveDateTime>,
        last_backup: Option<NaiveDateTime>,
    ) -> Candidate {
        Candidate {
            pv: "v1".to_string(),
            mode: VolumeMode::Filesystem,
            namespace: namespace.to_string(),
            name: "c1".to_string(),
            last_attempt,
            last_backup,
            rbd_pool: "p".to_string(),
            rbd_name: "i".to_string(),
            fstype: None,
            size: None,
        }
    }

    fn worker_job(namespace: &str, active: i32, failed: bool) -> Job {
        Job {
            metadata: ObjectMeta {
                name: Some("backup-rbd-fs-x".to_string()),
                labels: Some(
                    [(LABEL_PVC_NAMESPACE.to_string(), namespace.to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            status: Some(JobStatus {
                active: Some(active),
                conditions: failed.then(|| {
                    vec![JobCondition {
                        type_: "Failed".to_string(),
                        status: "True".to_string(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    // ---------------------------------------------------------------------
    // Derivation
    // ---------------------------------------------------------------------

    #[test]
    fn counts_candidates_per_namespace() {
        let now = at(12);
        let candidates = vec![
            candidate("ns1", None, None),
            candidate("ns1", Some(now), Some(now)),
            candidate("ns2", None, None),
        ];
        let stats = derive(&candidates, &[], &[], now);
        assert_eq!(stats.namespaces["ns1"].volumes, 2);
        assert_eq!(stats.namespaces["ns1"].never_backed_up, 1);
        assert_eq!(stats.namespaces["ns2"].volumes, 1);
    }

    #[test]
    fn due_bucket_math() {
        let now = at(12);
        // Never attempted: immediately due.
        assert_eq!(due_bucket(None, now), 0);
        // Attempted just now: due again in 24h.
        assert_eq!(due_bucket(Some(now), now), 24);
        // Attempted 6h ago: due in 18h.
        assert_eq!(due_bucket(Some(now - Duration::hours(6)), now), 18);
        // Attempted 3 days ago: overdue, clamped at 0.
        assert_eq!(due_bucket(Some(now - Duration::days(3)), now), 0);
        // Partial hours round up.
        assert_eq!(
            due_bucket(Some(now - Duration::minutes(6 * 60 + 30)), now),
            18,
        );
    }

    #[test]
    fn age_bucket_math() {
        let now = at(12);
        assert_eq!(age_bucket(now, now), 0);
        assert_eq!(age_bucket(now - Duration::minutes(90), now), 1);
        assert_eq!(age_bucket(now - Duration::hours(36), now), 36);
        // Beyond the range lands in the top bucket.
        assert_eq!(age_bucket(now - Duration::days(10), now), 36);
    }

    #[test]
    fn classifies_worker_jobs() {
        let now = at(12);
        let jobs = vec![
            worker_job("ns1", 1, false),
            worker_job("ns1", 0, true),
            worker_job("ns2", 1, false),
        ];
        let stats = derive(&[], &jobs, &[], now);
        assert_eq!(stats.namespaces["ns1"].running_jobs, 1);
        assert_eq!(stats.namespaces["ns1"].failed_jobs, 1);
        assert_eq!(stats.namespaces["ns2"].running_jobs, 1);
        assert_eq!(stats.failed_crons, 0);
    }

    #[test]
    fn counts_failed_cron_ticks() {
        let cron = CronJob {
            metadata: ObjectMeta {
                name: Some("ceph-backup".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut tick_job = worker_job("unused", 0, true);
        tick_job.metadata.labels = None;
        tick_job.metadata.owner_references = Some(vec![OwnerReference {
            kind: "CronJob".to_string(),
            name: "ceph-backup".to_string(),
            ..Default::default()
        }]);

        let stats = derive(&[], &[tick_job], &[cron], at(12));
        assert_eq!(stats.failed_crons, 1);
        assert!(stats.namespaces.is_empty());
    }

    // ---------------------------------------------------------------------
    // Encoding
    // ---------------------------------------------------------------------

    #[test]
    fn encodes_all_families() {
        let now = at(12);
        let candidates = vec![candidate("ns1", Some(now), Some(now - Duration::hours(2)))];
        let out = encode(&derive(&candidates, &[], &[], now)).unwrap();

        assert!(out.contains("volumes_backed_up{namespace=\"ns1\"} 1"));
        assert!(out.contains("volume_never_backed_up{namespace=\"ns1\"} 0"));
        assert!(out.contains("volume_backups_due_bucket"));
        assert!(out.contains("volume_backup_age_bucket"));
        assert!(out.contains("failed_backup_crons 0"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let now = at(12);
        // One backup 2h old, one 5h old: the le="5" bucket holds both.
        let candidates = vec![
            candidate("ns1", None, Some(now - Duration::hours(2))),
            candidate("ns1", None, Some(now - Duration::hours(5))),
        ];
        let out = encode(&derive(&candidates, &[], &[], now)).unwrap();
        assert!(out.contains("volume_backup_age_count{namespace=\"ns1\"} 2"));
        assert!(out.contains("le=\"+Inf\"} 2"));
    }
}
