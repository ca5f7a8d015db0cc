//! Cluster readiness polling

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::DeployError;
use crate::privilege::session::SessionManager;

const READY_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Cluster polling options
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Exists once the cluster runtime is installed
    pub marker_file: PathBuf,
    pub ready_command: String,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            marker_file: PathBuf::from("/etc/rancher/k3s/k3s.yaml"),
            ready_command: "kubectl get nodes --no-headers".to_string(),
            poll_interval: Duration::from_secs(5),
            poll_attempts: 12,
        }
    }
}

/// Reports how many cluster nodes are ready
#[async_trait]
pub trait ClusterProbe: Send + Sync {
    async fn ready_nodes(
        &self,
        session: &SessionManager,
        cancel: &CancellationToken,
    ) -> Result<usize, DeployError>;
}

/// Probe that lists nodes with kubectl through the privileged session
#[derive(Debug, Clone)]
pub struct KubectlProbe {
    marker_file: PathBuf,
    ready_command: String,
}

impl KubectlProbe {
    pub fn new(options: &ClusterOptions) -> Self {
        Self {
            marker_file: options.marker_file.clone(),
            ready_command: options.ready_command.clone(),
        }
    }
}

#[async_trait]
impl ClusterProbe for KubectlProbe {
    async fn ready_nodes(
        &self,
        session: &SessionManager,
        cancel: &CancellationToken,
    ) -> Result<usize, DeployError> {
        if !tokio::fs::try_exists(&self.marker_file).await.unwrap_or(false) {
            debug!("Cluster config {} not present yet", self.marker_file.display());
            return Ok(0);
        }

        let mut env = BTreeMap::new();
        env.insert(
            "KUBECONFIG".to_string(),
            self.marker_file.to_string_lossy().into_owned(),
        );
        let output = session
            .execute(&self.ready_command, Some(READY_COMMAND_TIMEOUT), &env, cancel)
            .await?;
        Ok(count_ready_nodes(&output))
    }
}

/// Count `kubectl get nodes` lines whose STATUS column is exactly `Ready`
pub fn count_ready_nodes(output: &str) -> usize {
    output
        .lines()
        .filter(|line| {
            line.split_whitespace()
                .nth(1)
                .map(|status| status.split(',').any(|s| s == "Ready"))
                .unwrap_or(false)
        })
        .count()
}

/// Poll until at least one node is ready, a bounded number of times
pub async fn wait_until_ready(
    probe: &dyn ClusterProbe,
    session: &SessionManager,
    options: &ClusterOptions,
    cancel: &CancellationToken,
) -> Result<usize, DeployError> {
    let attempts = options.poll_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match probe.ready_nodes(session, cancel).await {
            Ok(0) => debug!("Cluster not ready yet ({}/{})", attempt, attempts),
            Ok(nodes) => {
                info!("Cluster ready with {} node(s)", nodes);
                return Ok(nodes);
            }
            Err(e) if e.is_aborted() => return Err(e),
            Err(e) => {
                debug!("Cluster probe failed ({}/{}): {}", attempt, attempts, e);
                last_error = Some(e);
            }
        }

        if attempt < attempts {
            tokio::select! {
                _ = sleep(options.poll_interval) => {}
                _ = cancel.cancelled() => return Err(DeployError::Aborted),
            }
        }
    }

    let waited = options.poll_interval * (attempts - 1);
    let detail = match last_error {
        Some(e) => format!(": last probe failed with {}", e),
        None => String::new(),
    };
    Err(DeployError::ClusterError(format!(
        "no ready node after {} attempts over {}s{}",
        attempts,
        waited.as_secs(),
        detail
    )))
}
