//! Process configuration, read once from the environment at startup.

use crate::error::{Error, Result};
use crate::metadata;

/// How the worker pods reach the Ceph cluster.
#[derive(Debug, Clone)]
pub struct CephConfig {
    /// Monitor addresses for the in-tree RBD volume source.
    pub monitors: Vec<String>,
    pub user: String,
    /// Secret holding the user's keyring, referenced by RBD volumes.
    pub secret_name: String,
    /// Secret mounted into raw-block workers at /var/run/secrets/ceph.
    pub key_secret_name: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// The namespace worker jobs and their bound artifacts are created in.
    pub namespace: String,
    pub ceph: CephConfig,
    /// Secret with `url` and `password` keys for the restic repository.
    pub restic_secret_name: String,
    pub backup_image: String,
    pub backup_image_pull_policy: String,
}

fn required(name: &'static str) -> Result<String> {
    std::env::var(name).map_err(|_| Error::MissingEnv(name))
}

fn defaulted(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let monitors: Vec<String> = required("CEPH_MONITORS")?
            .split(',')
            .filter(|mon| !mon.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Config {
            namespace: metadata::reserved_namespace(),
            ceph: CephConfig {
                monitors,
                user: required("CEPH_USER")?,
                secret_name: defaulted("CEPH_SECRET_NAME", "ceph"),
                key_secret_name: defaulted("CEPH_KEY_SECRET_NAME", "ceph-key"),
            },
            restic_secret_name: defaulted("RESTIC_SECRET_NAME", "restic"),
            backup_image: required("BACKUP_IMAGE")?,
            backup_image_pull_policy: defaulted("BACKUP_IMAGE_PULL_POLICY", "IfNotPresent"),
        })
    }
}
