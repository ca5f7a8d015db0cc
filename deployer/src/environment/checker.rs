//! Read-only host checks run before any privileged work

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sysinfo::{Disks, System};
use tracing::{debug, info, warn};

use crate::errors::DeployError;

const GIB: u64 = 1024 * 1024 * 1024;

/// Tools installed through the distribution package manager
pub const BASIC_TOOLS: &[&str] = &["git", "curl", "docker"];

/// Tools installed by the bundled tools installer
pub const CLUSTER_TOOLS: &[&str] = &["kubectl", "helm", "k3s"];

/// Result of a full environment check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvironmentReport {
    pub success: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub missing_basic_tools: Vec<String>,
    pub missing_cluster_tools: Vec<String>,
}

impl EnvironmentReport {
    pub fn needs_basic_tools(&self) -> bool {
        !self.missing_basic_tools.is_empty()
    }

    pub fn needs_cluster_tools(&self) -> bool {
        !self.missing_cluster_tools.is_empty()
    }

    fn error(&mut self, message: String) {
        self.success = false;
        self.errors.push(message);
    }
}

/// Host checks consumed by the orchestrator
#[async_trait]
pub trait EnvironmentChecker: Send + Sync {
    async fn check_all(&self) -> EnvironmentReport;
}

/// Checker options
#[derive(Debug, Clone)]
pub struct CheckerOptions {
    pub min_memory_bytes: u64,
    pub min_disk_bytes: u64,
    /// Mount point whose free space is checked
    pub disk_mount: PathBuf,
    pub resolv_conf: PathBuf,
    /// HTTPS endpoint probed for outbound connectivity
    pub probe_url: String,
    pub probe_connect_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for CheckerOptions {
    fn default() -> Self {
        Self {
            min_memory_bytes: 4 * GIB,
            min_disk_bytes: 4 * GIB,
            disk_mount: PathBuf::from("/"),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            probe_url: "https://www.baidu.com".to_string(),
            probe_connect_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// Checks the local host with sysinfo, PATH lookups and an HTTPS probe
#[derive(Debug, Clone, Default)]
pub struct SystemEnvironmentChecker {
    options: CheckerOptions,
}

impl SystemEnvironmentChecker {
    pub fn new(options: CheckerOptions) -> Self {
        Self { options }
    }

    async fn probe_network(&self) -> Result<(), DeployError> {
        let client = reqwest::Client::builder()
            .connect_timeout(self.options.probe_connect_timeout)
            .timeout(self.options.probe_timeout)
            .build()?;
        let response = client.head(&self.options.probe_url).send().await?;
        debug!("Network probe {} -> {}", self.options.probe_url, response.status());
        Ok(())
    }
}

#[async_trait]
impl EnvironmentChecker for SystemEnvironmentChecker {
    async fn check_all(&self) -> EnvironmentReport {
        let mut report = EnvironmentReport {
            success: true,
            ..Default::default()
        };

        let (hostname, memory, disk) = {
            let mount = self.options.disk_mount.clone();
            match tokio::task::spawn_blocking(move || {
                let mut sys = System::new();
                sys.refresh_memory();
                (System::host_name(), sys.total_memory(), available_disk(&mount))
            })
            .await
            {
                Ok(sample) => sample,
                Err(e) => {
                    report.error(format!("System inspection failed: {}", e));
                    return report;
                }
            }
        };

        if let Err(warning) = check_hostname(hostname.as_deref()) {
            report.warnings.push(warning);
        }

        let resolv = tokio::fs::read_to_string(&self.options.resolv_conf).await.ok();
        if let Err(warning) = check_resolv_conf(resolv.as_deref()) {
            report.warnings.push(warning);
        }

        if let Err(error) = check_minimum("Memory", memory, self.options.min_memory_bytes) {
            report.error(error);
        }

        match disk {
            Some(available) => {
                if let Err(error) = check_minimum("Disk space", available, self.options.min_disk_bytes) {
                    report.error(error);
                }
            }
            None => report.error(format!(
                "Disk space: no disk mounted at {}",
                self.options.disk_mount.display()
            )),
        }

        if let Err(e) = self.probe_network().await {
            report.error(format!(
                "Network check: cannot reach {} ({})",
                self.options.probe_url, e
            ));
        }

        report.missing_basic_tools = missing_tools(BASIC_TOOLS);
        report.missing_cluster_tools = missing_tools(CLUSTER_TOOLS);
        if report.needs_basic_tools() {
            report.warnings.push(format!(
                "Missing basic tools: {}",
                report.missing_basic_tools.join(", ")
            ));
        }
        if report.needs_cluster_tools() {
            report.warnings.push(format!(
                "Missing cluster tools: {}, they will be installed",
                report.missing_cluster_tools.join(", ")
            ));
        }

        for warning in &report.warnings {
            warn!("{}", warning);
        }
        info!(
            "Environment check finished: {} error(s), {} warning(s)",
            report.errors.len(),
            report.warnings.len()
        );
        report
    }
}

fn available_disk(mount: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .find(|disk| disk.mount_point() == mount)
        .map(|disk| disk.available_space())
}

fn check_hostname(hostname: Option<&str>) -> Result<(), String> {
    match hostname.map(str::trim) {
        Some(name) if !name.is_empty() => Ok(()),
        _ => Err("Hostname is not set".to_string()),
    }
}

fn check_resolv_conf(content: Option<&str>) -> Result<(), String> {
    match content {
        None => Err("DNS: resolv.conf does not exist".to_string()),
        Some(content) if !content.contains("nameserver") => {
            Err("DNS: no nameserver configured".to_string())
        }
        Some(_) => Ok(()),
    }
}

fn check_minimum(what: &str, actual: u64, required: u64) -> Result<(), String> {
    if actual < required {
        return Err(format!(
            "{}: {}MB available, {}MB required",
            what,
            actual / (1024 * 1024),
            required / (1024 * 1024)
        ));
    }
    Ok(())
}

/// Tools from `tools` that are not on PATH
pub fn missing_tools(tools: &[&str]) -> Vec<String> {
    tools
        .iter()
        .filter(|tool| which::which(tool).is_err())
        .map(|tool| tool.to_string())
        .collect()
}
