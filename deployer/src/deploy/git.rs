//! Installer repository sync

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::{looks_like_network_failure, DeployError};

/// Outcome of a sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Cloned,
    Updated,
}

/// Where the installer scripts come from
#[async_trait]
pub trait InstallerSource: Send + Sync {
    /// Make `target_dir` hold an up-to-date copy. Idempotent.
    async fn sync(&self, target_dir: &Path, cancel: &CancellationToken) -> Result<SyncKind, DeployError>;
}

/// Git repository source: clone when absent, fast-forward pull otherwise
#[derive(Debug, Clone)]
pub struct GitSource {
    url: String,
    branch: String,
}

impl GitSource {
    pub fn new(url: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            branch: branch.into(),
        }
    }
}

#[async_trait]
impl InstallerSource for GitSource {
    async fn sync(&self, target_dir: &Path, cancel: &CancellationToken) -> Result<SyncKind, DeployError> {
        info!(
            "Syncing installer repository: {} (branch: {}) to {}",
            self.url,
            self.branch,
            target_dir.display()
        );

        if target_dir.join(".git").exists() {
            debug!("Repository exists, pulling updates...");
            let mut cmd = Command::new("git");
            cmd.current_dir(target_dir)
                .args(["pull", "--ff-only", "origin", &self.branch]);
            run_git(cmd, "pull", cancel).await?;
            Ok(SyncKind::Updated)
        } else {
            if let Some(parent) = target_dir.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            debug!("Cloning repository to {}...", target_dir.display());
            let mut cmd = Command::new("git");
            cmd.args(["clone", "--branch", &self.branch, &self.url])
                .arg(target_dir);
            run_git(cmd, "clone", cancel).await?;
            Ok(SyncKind::Cloned)
        }
    }
}

async fn run_git(mut cmd: Command, action: &str, cancel: &CancellationToken) -> Result<(), DeployError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => DeployError::NotFound("git executable".to_string()),
        _ => DeployError::IoError(e),
    })?;

    // dropping the child on cancel kills it
    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            info!("git {} cancelled", action);
            return Err(DeployError::Aborted);
        }
        output = child.wait_with_output() => output?,
    };

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if looks_like_network_failure(&stderr) {
        return Err(DeployError::NetworkError(format!("git {} failed: {}", action, stderr)));
    }
    Err(DeployError::ScriptError {
        code: output.status.code().unwrap_or(-1),
        stderr: format!("git {} failed: {}", action, stderr),
    })
}
