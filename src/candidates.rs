//! Eligibility filter: derives the ordered candidate list from a
//! fleet-wide snapshot of namespaces, claims and volumes.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDateTime};
use k8s_openapi::api::core::v1::{Namespace, PersistentVolume, PersistentVolumeClaim};
use kube::{Client, ResourceExt};
use tracing::warn;

use crate::error::Result;
use crate::k8s;
use crate::metadata::{
    parse_date, OptIn, ANNOTATION_ENABLED, ANNOTATION_LAST_ATTEMPT, ANNOTATION_LAST_BACKUP,
};

/// CSI driver that marks a volume as an RBD image we can back up.
const RBD_CSI_DRIVER: &str = "rbd.csi.ceph.com";

/// A volume without a recorded attempt becomes eligible 6 hours after
/// provisioning (the scheduler's due window is 24h minus 30min).
const NEW_VOLUME_GRACE: i64 = 18;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeMode {
    Filesystem,
    Block,
    /// Anything else the orchestrator may report; skipped at launch.
    Unknown(String),
}

impl VolumeMode {
    pub fn parse(raw: Option<&str>) -> VolumeMode {
        match raw {
            // Filesystem is the orchestrator's default when unset.
            None | Some("Filesystem") => VolumeMode::Filesystem,
            Some("Block") => VolumeMode::Block,
            Some(other) => VolumeMode::Unknown(other.to_string()),
        }
    }
}

/// A volume eligible for backup under the opt-in rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// PersistentVolume name; the stable identity of the source volume.
    pub pv: String,
    pub mode: VolumeMode,
    /// Namespace and name of the bound claim.
    pub namespace: String,
    pub name: String,
    pub last_attempt: Option<NaiveDateTime>,
    pub last_backup: Option<NaiveDateTime>,
    pub rbd_pool: String,
    pub rbd_name: String,
    pub fstype: Option<String>,
    pub size: Option<String>,
}

fn annotation<'a>(annotations: &'a Option<BTreeMap<String, String>>, key: &str) -> Option<&'a str> {
    annotations.as_ref().and_then(|a| a.get(key)).map(String::as_str)
}

/// Parses a date annotation, treating a malformed value as absent.
fn date_annotation(
    annotations: &Option<BTreeMap<String, String>>,
    key: &str,
    object: &str,
) -> Option<NaiveDateTime> {
    let raw = annotation(annotations, key)?;
    match parse_date(raw) {
        Ok(t) => Some(t),
        Err(_) => {
            warn!("Ignoring malformed {} annotation on {}: {:?}", key, object, raw);
            None
        }
    }
}

struct ClaimInfo {
    namespace: String,
    name: String,
    opt_in: OptIn,
    last_backup: Option<NaiveDateTime>,
}

/// Pure eligibility pass over the fleet snapshot. Order follows the
/// volume listing, so re-runs over unchanged state are stable.
pub fn build_candidates(
    reserved_namespace: &str,
    namespaces: &[Namespace],
    claims: &[PersistentVolumeClaim],
    volumes: &[PersistentVolume],
) -> Vec<Candidate> {
    let namespace_opt_in: BTreeMap<String, OptIn> = namespaces
        .iter()
        .map(|ns| {
            let opt_in = OptIn::parse(annotation(&ns.metadata.annotations, ANNOTATION_ENABLED));
            (ns.name_any(), opt_in)
        })
        .collect();

    // Index claims by the volume they are bound to.
    let mut claims_by_volume: BTreeMap<String, ClaimInfo> = BTreeMap::new();
    for claim in claims {
        let Some(volume_name) = claim.spec.as_ref().and_then(|s| s.volume_name.clone()) else {
            continue;
        };
        claims_by_volume.insert(
            volume_name,
            ClaimInfo {
                namespace: claim.namespace().unwrap_or_default(),
                name: claim.name_any(),
                opt_in: OptIn::parse(annotation(&claim.metadata.annotations, ANNOTATION_ENABLED)),
                last_backup: date_annotation(
                    &claim.metadata.annotations,
                    ANNOTATION_LAST_BACKUP,
                    &claim.name_any(),
                ),
            },
        );
    }

    let mut candidates = Vec::new();
    for volume in volumes {
        let pv_name = volume.name_any();
        let Some(spec) = volume.spec.as_ref() else {
            continue;
        };
        let Some(csi) = spec.csi.as_ref() else {
            continue;
        };
        if csi.driver != RBD_CSI_DRIVER {
            continue;
        }

        let attributes = csi.volume_attributes.clone().unwrap_or_default();
        let (Some(pool), Some(image)) = (attributes.get("pool"), attributes.get("imageName"))
        else {
            warn!("PersistentVolume {} lacks pool/imageName attributes", pv_name);
            continue;
        };

        let Some(claim) = claims_by_volume.get(&pv_name) else {
            warn!("PersistentVolume without a PersistentVolumeClaim: {}", pv_name);
            continue;
        };
        if claim.namespace == reserved_namespace {
            continue;
        }

        // Volume flag wins; otherwise any explicit opt-out on the
        // namespace or the claim excludes.
        let volume_opt_in =
            OptIn::parse(annotation(&volume.metadata.annotations, ANNOTATION_ENABLED));
        match volume_opt_in {
            OptIn::Disabled => continue,
            OptIn::Enabled => {}
            OptIn::Unset => {
                let namespace_opt_in = namespace_opt_in
                    .get(&claim.namespace)
                    .copied()
                    .unwrap_or_default();
                if namespace_opt_in == OptIn::Disabled || claim.opt_in == OptIn::Disabled {
                    continue;
                }
            }
        }

        let last_attempt = date_annotation(
            &volume.metadata.annotations,
            ANNOTATION_LAST_ATTEMPT,
            &pv_name,
        )
        .or_else(|| {
            volume
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0.naive_utc() - Duration::hours(NEW_VOLUME_GRACE))
        });

        candidates.push(Candidate {
            pv: pv_name,
            mode: VolumeMode::parse(spec.volume_mode.as_deref()),
            namespace: claim.namespace.clone(),
            name: claim.name.clone(),
            last_attempt,
            last_backup: claim.last_backup,
            rbd_pool: pool.clone(),
            rbd_name: image.clone(),
            fstype: csi.fs_type.clone(),
            size: spec
                .capacity
                .as_ref()
                .and_then(|c| c.get("storage"))
                .map(|q| q.0.clone()),
        });
    }

    candidates
}

/// Fetches the fleet snapshot and runs the eligibility pass.
pub async fn list_candidates(client: &Client, reserved_namespace: &str) -> Result<Vec<Candidate>> {
    let (namespaces, claims, volumes) = tokio::try_join!(
        k8s::list_namespaces(client),
        k8s::list_claims(client),
        k8s::list_volumes(client),
    )?;
    Ok(build_candidates(
        reserved_namespace,
        &namespaces,
        &claims,
        &volumes,
    ))
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{
        CSIPersistentVolumeSource, PersistentVolumeClaimSpec, PersistentVolumeSpec,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    use super::*;
    use crate::metadata::render_date;

    // ---------------------------------------------------------------------
    // Fixture builders
    // ---------------------------------------------------------------------

    fn annotations(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
        if pairs.is_empty() {
            return None;
        }
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn make_namespace(name: &str, backup: Option<&str>) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: annotations(
                    &backup.map(|v| (ANNOTATION_ENABLED, v)).into_iter().collect::<Vec<_>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn make_claim(
        namespace: &str,
        name: &str,
        volume_name: &str,
        extra: &[(&str, &str)],
    ) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                annotations: annotations(extra),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                volume_name: Some(volume_name.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn make_volume(name: &str, extra: &[(&str, &str)]) -> PersistentVolume {
        let mut attributes = BTreeMap::new();
        attributes.insert("pool".to_string(), "p".to_string());
        attributes.insert("imageName".to_string(), "i".to_string());
        attributes.insert("clusterID".to_string(), "ceph".to_string());

        let created = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut capacity = BTreeMap::new();
        capacity.insert("storage".to_string(), Quantity("10Gi".to_string()));

        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: annotations(extra),
                creation_timestamp: Some(Time(created)),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                capacity: Some(capacity),
                csi: Some(CSIPersistentVolumeSource {
                    driver: RBD_CSI_DRIVER.to_string(),
                    volume_attributes: Some(attributes),
                    fs_type: Some("ext4".to_string()),
                    ..Default::default()
                }),
                volume_mode: Some("Filesystem".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn fleet() -> (Vec<Namespace>, Vec<PersistentVolumeClaim>, Vec<PersistentVolume>) {
        (
            vec![make_namespace("ns1", None)],
            vec![make_claim("ns1", "c1", "v1", &[])],
            vec![make_volume("v1", &[])],
        )
    }

    // ---------------------------------------------------------------------
    // Candidate construction
    // ---------------------------------------------------------------------

    #[test]
    fn builds_candidate_for_bound_rbd_volume() {
        let (namespaces, claims, volumes) = fleet();
        let candidates = build_candidates("ceph-backup", &namespaces, &claims, &volumes);

        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.pv, "v1");
        assert_eq!(c.namespace, "ns1");
        assert_eq!(c.name, "c1");
        assert_eq!(c.mode, VolumeMode::Filesystem);
        assert_eq!(c.rbd_pool, "p");
        assert_eq!(c.rbd_name, "i");
        assert_eq!(c.fstype.as_deref(), Some("ext4"));
        assert_eq!(c.size.as_deref(), Some("10Gi"));
        assert_eq!(c.last_backup, None);
    }

    #[test]
    fn new_volume_gets_eighteen_hour_grace() {
        let (namespaces, claims, volumes) = fleet();
        let candidates = build_candidates("ceph-backup", &namespaces, &claims, &volumes);

        let created = chrono::DateTime::from_timestamp(1_700_000_000, 0)
            .unwrap()
            .naive_utc();
        assert_eq!(
            candidates[0].last_attempt,
            Some(created - Duration::hours(18)),
        );
    }

    #[test]
    fn last_attempt_annotation_overrides_grace() {
        let (namespaces, claims, mut volumes) = fleet();
        volumes[0] = make_volume("v1", &[(ANNOTATION_LAST_ATTEMPT, "2024-01-01T00:00:00Z")]);
        let candidates = build_candidates("ceph-backup", &namespaces, &claims, &volumes);

        assert_eq!(
            candidates[0].last_attempt.map(render_date).as_deref(),
            Some("2024-01-01T00:00:00Z"),
        );
    }

    #[test]
    fn claimless_volume_is_dropped() {
        let (namespaces, _, volumes) = fleet();
        let candidates = build_candidates("ceph-backup", &namespaces, &[], &volumes);
        assert!(candidates.is_empty());
    }

    #[test]
    fn reserved_namespace_claims_are_dropped() {
        let (namespaces, _, volumes) = fleet();
        let claims = vec![make_claim("ceph-backup", "clone-claim", "v1", &[])];
        let candidates = build_candidates("ceph-backup", &namespaces, &claims, &volumes);
        assert!(candidates.is_empty());
    }

    #[test]
    fn non_rbd_volume_is_dropped() {
        let (namespaces, claims, mut volumes) = fleet();
        volumes[0]
            .spec
            .as_mut()
            .unwrap()
            .csi
            .as_mut()
            .unwrap()
            .driver = "ebs.csi.aws.com".to_string();
        let candidates = build_candidates("ceph-backup", &namespaces, &claims, &volumes);
        assert!(candidates.is_empty());
    }

    // ---------------------------------------------------------------------
    // Opt-in resolution
    // ---------------------------------------------------------------------

    #[test]
    fn volume_opt_out_excludes() {
        let (namespaces, claims, mut volumes) = fleet();
        volumes[0] = make_volume("v1", &[(ANNOTATION_ENABLED, "no")]);
        assert!(build_candidates("ceph-backup", &namespaces, &claims, &volumes).is_empty());
    }

    #[test]
    fn volume_opt_in_overrides_namespace_opt_out() {
        let namespaces = vec![make_namespace("ns1", Some("false"))];
        let claims = vec![make_claim("ns1", "c1", "v1", &[])];
        let volumes = vec![make_volume("v1", &[(ANNOTATION_ENABLED, "yes")])];
        assert_eq!(
            build_candidates("ceph-backup", &namespaces, &claims, &volumes).len(),
            1,
        );
    }

    #[test]
    fn namespace_opt_out_excludes_unset_volume() {
        let namespaces = vec![make_namespace("ns1", Some("0"))];
        let claims = vec![make_claim("ns1", "c1", "v1", &[])];
        let volumes = vec![make_volume("v1", &[])];
        assert!(build_candidates("ceph-backup", &namespaces, &claims, &volumes).is_empty());
    }

    #[test]
    fn claim_opt_out_excludes_unset_volume() {
        let (namespaces, _, volumes) = fleet();
        let claims = vec![make_claim("ns1", "c1", "v1", &[(ANNOTATION_ENABLED, "false")])];
        assert!(build_candidates("ceph-backup", &namespaces, &claims, &volumes).is_empty());
    }

    #[test]
    fn unset_everywhere_includes() {
        let (namespaces, claims, volumes) = fleet();
        assert_eq!(
            build_candidates("ceph-backup", &namespaces, &claims, &volumes).len(),
            1,
        );
    }

    #[test]
    fn claim_last_backup_is_carried() {
        let (namespaces, _, volumes) = fleet();
        let claims = vec![make_claim(
            "ns1",
            "c1",
            "v1",
            &[(ANNOTATION_LAST_BACKUP, "2024-03-01T12:00:00Z")],
        )];
        let candidates = build_candidates("ceph-backup", &namespaces, &claims, &volumes);
        assert_eq!(
            candidates[0].last_backup.map(render_date).as_deref(),
            Some("2024-03-01T12:00:00Z"),
        );
    }

    #[test]
    fn block_mode_is_parsed() {
        let (namespaces, claims, mut volumes) = fleet();
        volumes[0].spec.as_mut().unwrap().volume_mode = Some("Block".to_string());
        let candidates = build_candidates("ceph-backup", &namespaces, &claims, &volumes);
        assert_eq!(candidates[0].mode, VolumeMode::Block);
    }
}
