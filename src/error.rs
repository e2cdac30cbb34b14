//! Error types shared across the controller.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    KubeconfigError(#[from] kube::config::KubeconfigError),

    #[error(transparent)]
    RbdError(#[from] crate::rbd::RbdError),

    #[error("required environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error("invalid date {0:?}, expected YYYY-MM-DDTHH:MM:SSZ")]
    InvalidDate(String),

    #[error("PersistentVolume {0} has no storage capacity recorded")]
    MissingCapacity(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode metrics")]
    MetricsEncode,

    #[error("tick deadline exceeded")]
    DeadlineExceeded,
}
