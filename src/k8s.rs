//! Typed Kubernetes access for the controller.
//!
//! Reads cover the whole fleet (namespaces, claims, volumes); writes are
//! scoped to the reserved namespace, except for annotation merge-patches
//! on a named volume or claim. All mutations are idempotent under retry:
//! annotations go through merge patches and bulk reclamation uses
//! delete-by-label-selector.

use std::path::Path;

use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, PersistentVolume, PersistentVolumeClaim,
};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use serde_json::Value;
use tracing::info;

use crate::error::Result;
use crate::metadata::{LABEL_PV_NAME, WORKER_JOB_SELECTOR};

/// Builds a client from an explicit kubeconfig path, or from the
/// default chain (environment, then in-cluster service account).
pub async fn make_client(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            info!("Using specified config file");
            let kubeconfig = Kubeconfig::read_from(path)?;
            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await?;
            Ok(Client::try_from(config)?)
        }
        None => {
            info!("Using in-cluster config");
            Ok(Client::try_default().await?)
        }
    }
}

// ============================================================================
// Fleet reads
// ============================================================================

pub async fn list_namespaces(client: &Client) -> Result<Vec<Namespace>> {
    let api: Api<Namespace> = Api::all(client.clone());
    Ok(api.list(&ListParams::default()).await?.items)
}

pub async fn list_claims(client: &Client) -> Result<Vec<PersistentVolumeClaim>> {
    let api: Api<PersistentVolumeClaim> = Api::all(client.clone());
    Ok(api.list(&ListParams::default()).await?.items)
}

pub async fn list_volumes(client: &Client) -> Result<Vec<PersistentVolume>> {
    let api: Api<PersistentVolume> = Api::all(client.clone());
    Ok(api.list(&ListParams::default()).await?.items)
}

/// Worker jobs the controller owns, in the reserved namespace.
pub async fn list_worker_jobs(client: &Client, namespace: &str) -> Result<Vec<Job>> {
    let api: Api<Job> = Api::namespaced(client.clone(), namespace);
    let params = ListParams::default().labels(WORKER_JOB_SELECTOR);
    Ok(api.list(&params).await?.items)
}

/// Every job in the reserved namespace, including tick jobs spawned by
/// the controller's own CronJob.
pub async fn list_jobs(client: &Client, namespace: &str) -> Result<Vec<Job>> {
    let api: Api<Job> = Api::namespaced(client.clone(), namespace);
    Ok(api.list(&ListParams::default()).await?.items)
}

pub async fn list_cron_jobs(client: &Client, namespace: &str) -> Result<Vec<CronJob>> {
    let api: Api<CronJob> = Api::namespaced(client.clone(), namespace);
    Ok(api.list(&ListParams::default()).await?.items)
}

/// Reads a claim, mapping 404 to `None`: a claim deleted concurrently
/// with the reaper is not an error.
pub async fn get_claim(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<Option<PersistentVolumeClaim>> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    match api.get(name).await {
        Ok(claim) => Ok(Some(claim)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Targeted writes
// ============================================================================

/// Merge-patches annotations onto a PersistentVolume.
pub async fn annotate_volume(client: &Client, pv_name: &str, annotations: Value) -> Result<()> {
    let api: Api<PersistentVolume> = Api::all(client.clone());
    let patch = serde_json::json!({"metadata": {"annotations": annotations}});
    api.patch(pv_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Merge-patches annotations onto a PersistentVolumeClaim.
pub async fn annotate_claim(
    client: &Client,
    namespace: &str,
    name: &str,
    annotations: Value,
) -> Result<()> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({"metadata": {"annotations": annotations}});
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Merge-patches a worker job; the body may touch both metadata and spec.
pub async fn patch_job(client: &Client, namespace: &str, name: &str, patch: Value) -> Result<()> {
    let api: Api<Job> = Api::namespaced(client.clone(), namespace);
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

// ============================================================================
// Reserved-namespace creates
// ============================================================================

pub async fn create_job(client: &Client, namespace: &str, job: &Job) -> Result<Job> {
    let api: Api<Job> = Api::namespaced(client.clone(), namespace);
    Ok(api.create(&PostParams::default(), job).await?)
}

pub async fn create_volume(client: &Client, volume: &PersistentVolume) -> Result<()> {
    let api: Api<PersistentVolume> = Api::all(client.clone());
    api.create(&PostParams::default(), volume).await?;
    Ok(())
}

pub async fn create_claim(
    client: &Client,
    namespace: &str,
    claim: &PersistentVolumeClaim,
) -> Result<()> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    api.create(&PostParams::default(), claim).await?;
    Ok(())
}

pub async fn create_config_map(
    client: &Client,
    namespace: &str,
    config_map: &ConfigMap,
) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    api.create(&PostParams::default(), config_map).await?;
    Ok(())
}

// ============================================================================
// Bulk reclamation
// ============================================================================

/// Deletes every bound claim, standalone volume and config map carrying
/// this volume's `pv-name` label. The label set written at launch makes
/// this selector exhaustive.
pub async fn delete_labeled_artifacts(
    client: &Client,
    namespace: &str,
    pv_name: &str,
) -> Result<()> {
    let selector = format!("{LABEL_PV_NAME}={pv_name}");
    let params = ListParams::default().labels(&selector);

    let claims: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    claims
        .delete_collection(&DeleteParams::default(), &params)
        .await?;

    let volumes: Api<PersistentVolume> = Api::all(client.clone());
    volumes
        .delete_collection(&DeleteParams::default(), &params)
        .await?;

    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    config_maps
        .delete_collection(&DeleteParams::default(), &params)
        .await?;

    Ok(())
}
