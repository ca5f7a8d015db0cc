//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deploy::cluster::ClusterOptions;
use crate::deploy::orchestrator::DeployOptions;
use crate::deploy::steps::Domains;
use crate::logs::LogLevel;
use crate::privilege::elevation::Launcher;
use crate::privilege::session::SessionOptions;

/// Deployer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Installer repository
    #[serde(default)]
    pub repository: RepositorySettings,

    /// Privileged session tuning
    #[serde(default)]
    pub session: SessionSettings,

    /// Cluster readiness polling
    #[serde(default)]
    pub cluster: ClusterSettings,

    /// Local domains served by the stack
    #[serde(default)]
    pub domains: DomainSettings,

    /// Hosts file receiving the local domain entries
    #[serde(default = "default_hosts_file")]
    pub hosts_file: PathBuf,

    /// Timeout for each installer step in seconds
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
}

fn default_hosts_file() -> PathBuf {
    PathBuf::from("/etc/hosts")
}

fn default_step_timeout() -> u64 {
    600
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            repository: RepositorySettings::default(),
            session: SessionSettings::default(),
            cluster: ClusterSettings::default(),
            domains: DomainSettings::default(),
            hosts_file: default_hosts_file(),
            step_timeout_secs: default_step_timeout(),
        }
    }
}

impl Settings {
    /// Runtime options for the privileged session manager
    pub fn session_options(&self) -> SessionOptions {
        let s = &self.session;
        let defaults = SessionOptions::default();
        SessionOptions {
            startup_timeout: Duration::from_secs(s.startup_timeout_secs),
            health_check_interval: Duration::from_secs(s.health_check_interval_secs),
            health_check_timeout: Duration::from_secs(s.health_check_timeout_secs),
            slow_command_warning: Duration::from_secs(s.slow_command_warning_secs),
            restart_attempts: s.restart_attempts,
            restart_backoff: Duration::from_secs(s.restart_backoff_secs),
            default_command_timeout: Duration::from_secs(s.default_command_timeout_secs),
            max_command_timeout: Duration::from_secs(s.max_command_timeout_secs),
            launcher: Launcher::elevated(&s.elevation_program),
            fallback_launcher: Launcher::elevated(&s.elevation_program),
            ..defaults
        }
    }

    /// Runtime options for cluster readiness polling
    pub fn cluster_options(&self) -> ClusterOptions {
        ClusterOptions {
            marker_file: PathBuf::from(&self.cluster.marker_file),
            ready_command: self.cluster.ready_command.clone(),
            poll_interval: Duration::from_secs(self.cluster.poll_interval_secs),
            poll_attempts: self.cluster.poll_attempts,
        }
    }

    /// Runtime options for the orchestrator
    pub fn deploy_options(&self) -> DeployOptions {
        DeployOptions {
            domains: Domains {
                application: self.domains.application.clone(),
                auth: self.domains.auth.clone(),
            },
            hosts_file: self.hosts_file.clone(),
            step_timeout: Duration::from_secs(self.step_timeout_secs),
            cluster: self.cluster_options(),
            require_privilege: cfg!(target_os = "linux"),
        }
    }
}

/// Installer repository settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositorySettings {
    /// Clone URL
    #[serde(default = "default_repository_url")]
    pub url: String,

    /// Branch to clone and fast-forward
    #[serde(default = "default_repository_branch")]
    pub branch: String,
}

fn default_repository_url() -> String {
    "https://gitee.com/openeuler/euler-copilot-framework.git".to_string()
}

fn default_repository_branch() -> String {
    "master".to_string()
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            url: default_repository_url(),
            branch: default_repository_branch(),
        }
    }
}

/// Privileged session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// How long to wait for credential entry and the worker's ready marker
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_secs: u64,

    /// A command outstanding longer than this is logged as slow
    #[serde(default = "default_slow_command_warning")]
    pub slow_command_warning_secs: u64,

    #[serde(default = "default_restart_attempts")]
    pub restart_attempts: u32,

    /// Backoff step; attempt n waits n times this
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub default_command_timeout_secs: u64,

    #[serde(default = "default_max_command_timeout")]
    pub max_command_timeout_secs: u64,

    /// Graphical elevation helper
    #[serde(default = "default_elevation_program")]
    pub elevation_program: String,
}

fn default_startup_timeout() -> u64 {
    120
}

fn default_health_check_interval() -> u64 {
    60
}

fn default_health_check_timeout() -> u64 {
    10
}

fn default_slow_command_warning() -> u64 {
    20 * 60
}

fn default_restart_attempts() -> u32 {
    3
}

fn default_restart_backoff() -> u64 {
    2
}

fn default_command_timeout() -> u64 {
    60
}

fn default_max_command_timeout() -> u64 {
    600
}

fn default_elevation_program() -> String {
    "pkexec".to_string()
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            startup_timeout_secs: default_startup_timeout(),
            health_check_interval_secs: default_health_check_interval(),
            health_check_timeout_secs: default_health_check_timeout(),
            slow_command_warning_secs: default_slow_command_warning(),
            restart_attempts: default_restart_attempts(),
            restart_backoff_secs: default_restart_backoff(),
            default_command_timeout_secs: default_command_timeout(),
            max_command_timeout_secs: default_max_command_timeout(),
            elevation_program: default_elevation_program(),
        }
    }
}

/// Cluster readiness settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// File that exists once the cluster runtime is installed
    #[serde(default = "default_marker_file")]
    pub marker_file: String,

    /// Command listing nodes, one per line, STATUS in the second column
    #[serde(default = "default_ready_command")]
    pub ready_command: String,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
}

fn default_marker_file() -> String {
    "/etc/rancher/k3s/k3s.yaml".to_string()
}

fn default_ready_command() -> String {
    "kubectl get nodes --no-headers".to_string()
}

fn default_poll_interval() -> u64 {
    5
}

fn default_poll_attempts() -> u32 {
    12
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            marker_file: default_marker_file(),
            ready_command: default_ready_command(),
            poll_interval_secs: default_poll_interval(),
            poll_attempts: default_poll_attempts(),
        }
    }
}

/// Local domain settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainSettings {
    #[serde(default = "default_application_domain")]
    pub application: String,

    #[serde(default = "default_auth_domain")]
    pub auth: String,
}

fn default_application_domain() -> String {
    "www.eulercopilot.local".to_string()
}

fn default_auth_domain() -> String {
    "authhub.eulercopilot.local".to_string()
}

impl Default for DomainSettings {
    fn default() -> Self {
        Self {
            application: default_application_domain(),
            auth: default_auth_domain(),
        }
    }
}
