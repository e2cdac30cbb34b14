//! Label and annotation schema shared by the controller and the metrics
//! exporter.
//!
//! Every key is prefixed with `ceph-backup.io/`. The labels on a worker
//! job are the only link between the job and the artifacts it owns
//! (snapshot, clone, bound claim, layout config map), so the reaper can
//! reclaim everything by label selector alone.

use chrono::NaiveDateTime;

use crate::error::{Error, Result};

pub const METADATA_PREFIX: &str = "ceph-backup.io/";

pub const LABEL_VOLUME_TYPE: &str = "ceph-backup.io/volume-type";
pub const LABEL_VOLUME_MODE: &str = "ceph-backup.io/volume-mode";
pub const LABEL_PV_NAME: &str = "ceph-backup.io/pv-name";
pub const LABEL_PVC_NAMESPACE: &str = "ceph-backup.io/pvc-namespace";
pub const LABEL_PVC_NAME: &str = "ceph-backup.io/pvc-name";
pub const LABEL_RBD_POOL: &str = "ceph-backup.io/rbd-pool";
pub const LABEL_RBD_NAME: &str = "ceph-backup.io/rbd-name";

/// Opt-in annotation accepted on namespaces, claims and volumes.
pub const ANNOTATION_ENABLED: &str = "ceph-backup.io/backup";
/// On the PersistentVolume: when the last backup attempt started.
pub const ANNOTATION_LAST_ATTEMPT: &str = "ceph-backup.io/last-start";
/// On the PersistentVolumeClaim: start time of the last successful backup.
pub const ANNOTATION_LAST_BACKUP: &str = "ceph-backup.io/last-backup";
/// On the worker job: the tick timestamp that created it.
pub const ANNOTATION_START_TIME: &str = "ceph-backup.io/start-time";
/// On the worker job: set once artifact reclamation finished.
pub const ANNOTATION_CLEANED_UP: &str = "ceph-backup.io/cleaned-up";

/// Selector matching every worker job the controller owns.
pub const WORKER_JOB_SELECTOR: &str = "ceph-backup.io/volume-type=rbd";

/// The namespace where worker jobs and their bound artifacts live.
pub fn reserved_namespace() -> String {
    std::env::var("NAMESPACE").unwrap_or_else(|_| "ceph-backup".to_string())
}

/// Tri-state backup opt-in carried by the `backup` annotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OptIn {
    Enabled,
    Disabled,
    #[default]
    Unset,
}

impl OptIn {
    /// Parses `1|yes|true` / `0|no|false` (case-insensitive); anything
    /// else, including a missing annotation, is `Unset`.
    pub fn parse(value: Option<&str>) -> OptIn {
        match value.map(|v| v.to_ascii_lowercase()).as_deref() {
            Some("1") | Some("yes") | Some("true") => OptIn::Enabled,
            Some("0") | Some("no") | Some("false") => OptIn::Disabled,
            _ => OptIn::Unset,
        }
    }
}

/// Parses an ISO-8601 UTC date with trailing `Z` and second precision.
/// The accepted form is exactly 20 characters.
pub fn parse_date(s: &str) -> Result<NaiveDateTime> {
    if s.len() != 20 || !s.ends_with('Z') {
        return Err(Error::InvalidDate(s.to_string()));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ")
        .map_err(|_| Error::InvalidDate(s.to_string()))
}

/// Renders a UTC datetime in the annotation format, truncated to second
/// precision.
pub fn render_date(t: NaiveDateTime) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveDateTime};
    use proptest::prelude::*;

    use super::*;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    // -------------------------------------------------------------------
    // Dates
    // -------------------------------------------------------------------

    #[test]
    fn render_is_twenty_characters_with_trailing_z() {
        let s = render_date(dt(2024, 1, 1, 0, 0, 0));
        assert_eq!(s, "2024-01-01T00:00:00Z");
        assert_eq!(s.len(), 20);
    }

    #[test]
    fn parse_accepts_rendered_dates() {
        let t = dt(2024, 2, 29, 13, 37, 59);
        assert_eq!(parse_date(&render_date(t)).unwrap(), t);
    }

    #[test]
    fn parse_rejects_missing_z() {
        assert!(parse_date("2024-01-01T00:00:00+").is_err());
        assert!(parse_date("2024-01-01T00:00:00").is_err());
    }

    #[test]
    fn parse_rejects_subsecond_precision() {
        assert!(parse_date("2024-01-01T00:00:00.5Z").is_err());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_date("").is_err());
        assert!(parse_date("not-a-date-not-a-dZ").is_err());
    }

    proptest! {
        #[test]
        fn parse_render_round_trip(secs in 0i64..253_402_300_799) {
            let t = chrono::DateTime::from_timestamp(secs, 0).unwrap().naive_utc();
            prop_assert_eq!(parse_date(&render_date(t)).unwrap(), t);
        }
    }

    // -------------------------------------------------------------------
    // Opt-in
    // -------------------------------------------------------------------

    #[test]
    fn opt_in_truth_table() {
        for v in ["1", "yes", "true", "True", "YES"] {
            assert_eq!(OptIn::parse(Some(v)), OptIn::Enabled, "{v}");
        }
        for v in ["0", "no", "false", "False", "NO"] {
            assert_eq!(OptIn::parse(Some(v)), OptIn::Disabled, "{v}");
        }
        for v in ["", "2", "maybe", "on"] {
            assert_eq!(OptIn::parse(Some(v)), OptIn::Unset, "{v:?}");
        }
        assert_eq!(OptIn::parse(None), OptIn::Unset);
    }
}
