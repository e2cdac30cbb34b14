//! Thin adapter over the `rbd` command-line tool.
//!
//! Every invocation is echoed to the log together with its exit status.
//! Cleanup paths rely on `exists` + `rm` so they stay idempotent across
//! crashed prior ticks.

use std::process::Output;

use thiserror::Error;
use tokio::process::Command;
use tracing::info;

#[derive(Debug, Error)]
pub enum RbdError {
    #[error("'rbd' could not be executed: {0}")]
    CommandExecution(#[from] tokio::io::Error),
    #[error("'rbd {command}' exited with status {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },
}

/// Fully qualified image name, `pool/image`.
pub fn fq_image(pool: &str, image: &str) -> String {
    format!("{pool}/{image}")
}

/// The single point-in-time snapshot the controller keeps per image.
pub fn fq_snapshot(pool: &str, image: &str) -> String {
    format!("{pool}/{image}@backup")
}

/// Name of the writable clone derived from the `@backup` snapshot.
pub fn backup_image(image: &str) -> String {
    format!("backup-{image}")
}

pub fn fq_backup_image(pool: &str, image: &str) -> String {
    format!("{pool}/backup-{image}")
}

#[derive(Debug, Clone, Default)]
pub struct RbdClient;

impl RbdClient {
    pub fn new() -> RbdClient {
        RbdClient
    }

    async fn run(&self, args: &[&str]) -> Result<Output, RbdError> {
        info!("> rbd {}", args.join(" "));
        let output = Command::new("rbd").args(args).output().await?;
        info!("-> {}", output.status.code().unwrap_or(-1));
        Ok(output)
    }

    /// Runs the command and fails with the preserved exit code and
    /// stderr unless it exits 0.
    async fn check(&self, args: &[&str]) -> Result<Output, RbdError> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(RbdError::CommandFailed {
                command: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// True iff `rbd info` exits 0 for the image or snapshot.
    pub async fn exists(&self, fq: &str) -> Result<bool, RbdError> {
        let output = self.run(&["info", fq]).await?;
        Ok(output.status.success())
    }

    pub async fn snap_create(&self, fq_snapshot: &str) -> Result<(), RbdError> {
        self.check(&["snap", "create", fq_snapshot]).await?;
        Ok(())
    }

    pub async fn snap_protect(&self, fq_snapshot: &str) -> Result<(), RbdError> {
        self.check(&["snap", "protect", fq_snapshot]).await?;
        Ok(())
    }

    pub async fn snap_unprotect(&self, fq_snapshot: &str) -> Result<(), RbdError> {
        self.check(&["snap", "unprotect", fq_snapshot]).await?;
        Ok(())
    }

    pub async fn snap_rm(&self, fq_snapshot: &str) -> Result<(), RbdError> {
        self.check(&["snap", "rm", fq_snapshot]).await?;
        Ok(())
    }

    pub async fn clone(&self, fq_snapshot: &str, fq_dest: &str) -> Result<(), RbdError> {
        self.check(&["clone", fq_snapshot, fq_dest]).await?;
        Ok(())
    }

    pub async fn rm(&self, fq: &str) -> Result<(), RbdError> {
        self.check(&["rm", fq]).await?;
        Ok(())
    }

    /// Whole-object diff of an image as JSON. Raw-block mode stores this
    /// next to the worker so the qcow2 writer knows the allocated extents.
    pub async fn diff_json(&self, fq: &str) -> Result<Vec<u8>, RbdError> {
        let output = self
            .check(&["diff", "--whole-object", "--format=json", fq])
            .await?;
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fully_qualified_names() {
        assert_eq!(fq_image("rbd", "img"), "rbd/img");
        assert_eq!(fq_snapshot("rbd", "img"), "rbd/img@backup");
        assert_eq!(backup_image("img"), "backup-img");
        assert_eq!(fq_backup_image("rbd", "img"), "rbd/backup-img");
    }
}
