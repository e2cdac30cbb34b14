//! Human-readable candidate listing for `ceph-backup-metrics --table`.

use comfy_table::Table;
use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;

use crate::candidates::Candidate;
use crate::metadata::{render_date, LABEL_PV_NAME};

fn job_names_for(pv: &str, jobs: &[Job]) -> String {
    let names: Vec<String> = jobs
        .iter()
        .filter(|job| {
            job.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(LABEL_PV_NAME))
                .map(|v| v == pv)
                .unwrap_or(false)
        })
        .map(|job| job.name_any())
        .collect();
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(", ")
    }
}

pub fn candidate_table(candidates: &[Candidate], jobs: &[Job]) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["NAMESPACE", "PVC", "LAST ATTEMPT", "LAST BACKUP", "JOBS"]);
    for candidate in candidates {
        table.add_row(vec![
            candidate.namespace.clone(),
            candidate.name.clone(),
            candidate
                .last_attempt
                .map(render_date)
                .unwrap_or_else(|| "-".to_string()),
            candidate
                .last_backup
                .map(render_date)
                .unwrap_or_else(|| "-".to_string()),
            job_names_for(&candidate.pv, jobs),
        ]);
    }
    table
}
