//! Error types for the stack deployer

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::deploy::fsm::DeploymentPhase;

/// Why the privilege elevation helper refused to start the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionReason {
    /// The operator is not allowed to elevate, or authentication failed
    Denied,

    /// The elevation helper (or the shell it launches) does not exist
    CommandNotFound,

    /// The credential dialog was dismissed
    AuthenticationAborted,
}

impl fmt::Display for PermissionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionReason::Denied => write!(f, "permission denied"),
            PermissionReason::CommandNotFound => write!(f, "elevation command not found"),
            PermissionReason::AuthenticationAborted => write!(f, "authentication aborted"),
        }
    }
}

/// Where a command timeout was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOrigin {
    /// The worker's own timeout wrapper exited with code 124
    Worker,

    /// The controller-side deadline elapsed before any completion marker
    Deadline,
}

/// Main error type for the stack deployer
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Environment check failed: {}", .0.join(", "))]
    EnvironmentError(Vec<String>),

    #[error("Permission error: {0}")]
    PermissionError(PermissionReason),

    #[error("Process lifecycle error: {0}")]
    ProcessLifecycleError(String),

    #[error("{}", describe_timeout(.step, .origin, .timeout))]
    CommandTimeoutError {
        step: Option<String>,
        origin: TimeoutOrigin,
        timeout: Duration,
    },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Script exited with code {code}: {stderr}")]
    ScriptError { code: i32, stderr: String },

    #[error("Cluster error: {0}")]
    ClusterError(String),

    #[error("Operation aborted")]
    Aborted,

    #[error("Privileged session is not active")]
    SessionInactive,

    #[error("Another privileged command is already executing")]
    CommandInFlight,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{phase} failed: {source}")]
    PhaseError {
        phase: DeploymentPhase,
        source: Box<DeployError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

fn describe_timeout(step: &Option<String>, origin: &TimeoutOrigin, timeout: &Duration) -> String {
    let subject = match step {
        Some(step) => format!("Step '{}'", step),
        None => "Command".to_string(),
    };
    match origin {
        TimeoutOrigin::Worker => format!("{} timed out inside the worker", subject),
        TimeoutOrigin::Deadline => format!(
            "{} execution timeout after {}s",
            subject,
            timeout.as_secs()
        ),
    }
}

impl From<anyhow::Error> for DeployError {
    fn from(err: anyhow::Error) -> Self {
        DeployError::Internal(err.to_string())
    }
}

impl DeployError {
    /// Attach phase context. An error that already carries a phase keeps it.
    pub fn in_phase(self, phase: DeploymentPhase) -> Self {
        match self {
            err @ DeployError::PhaseError { .. } => err,
            err => DeployError::PhaseError {
                phase,
                source: Box::new(err),
            },
        }
    }

    /// The underlying error without phase context
    pub fn root(&self) -> &DeployError {
        match self {
            DeployError::PhaseError { source, .. } => source.root(),
            err => err,
        }
    }

    /// The phase the error was raised in, if known
    pub fn phase(&self) -> Option<DeploymentPhase> {
        match self {
            DeployError::PhaseError { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Whether the error was caused by cancellation
    pub fn is_aborted(&self) -> bool {
        matches!(self.root(), DeployError::Aborted)
    }

    /// Name the step a timeout belongs to
    pub fn with_step(self, step_name: &str) -> Self {
        match self {
            DeployError::CommandTimeoutError {
                step: None,
                origin,
                timeout,
            } => DeployError::CommandTimeoutError {
                step: Some(step_name.to_string()),
                origin,
                timeout,
            },
            err => err,
        }
    }

    /// Classify into one of the operator-facing failure categories
    pub fn category(&self) -> FailureCategory {
        match self.root() {
            DeployError::Aborted => FailureCategory::Cancelled,
            DeployError::PermissionError(_) => FailureCategory::Permission,
            DeployError::NetworkError(_) | DeployError::HttpError(_) => FailureCategory::Network,
            DeployError::CommandTimeoutError { .. } => FailureCategory::Timeout,
            DeployError::ClusterError(_) => FailureCategory::Cluster,
            DeployError::NotFound(_) => FailureCategory::MissingFile,
            DeployError::IoError(e) => match e.kind() {
                std::io::ErrorKind::NotFound => FailureCategory::MissingFile,
                std::io::ErrorKind::PermissionDenied => FailureCategory::Permission,
                _ => categorize_text(&e.to_string()).unwrap_or(FailureCategory::Unknown),
            },
            DeployError::EnvironmentError(errors) => {
                categorize_text(&errors.join("\n")).unwrap_or(FailureCategory::Environment)
            }
            DeployError::ScriptError { stderr, .. } => {
                categorize_text(stderr).unwrap_or(FailureCategory::Script)
            }
            DeployError::ProcessLifecycleError(_)
            | DeployError::SessionInactive
            | DeployError::CommandInFlight => FailureCategory::Session,
            DeployError::ConfigError(_)
            | DeployError::ValidationError(_)
            | DeployError::YamlError(_)
            | DeployError::JsonError(_) => FailureCategory::Config,
            _ => FailureCategory::Unknown,
        }
    }

    /// The single human readable line shown to the operator
    pub fn user_message(&self) -> String {
        let category = self.category();
        match category {
            FailureCategory::Cancelled => category.headline().to_string(),
            _ => format!("{}: {}", category.headline(), self),
        }
    }
}

/// Operator-facing failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    Network,
    Permission,
    MissingFile,
    DiskSpace,
    Cancelled,
    Cluster,
    Timeout,
    Environment,
    Session,
    Config,
    Script,
    Unknown,
}

impl FailureCategory {
    pub fn headline(&self) -> &'static str {
        match self {
            FailureCategory::Network => "Network problem, check connectivity and DNS",
            FailureCategory::Permission => "Administrator permission was not granted",
            FailureCategory::MissingFile => "A required file is missing",
            FailureCategory::DiskSpace => "Not enough disk space",
            FailureCategory::Cancelled => "Deployment stopped",
            FailureCategory::Cluster => "The cluster did not become ready",
            FailureCategory::Timeout => "An installer timed out",
            FailureCategory::Environment => "The host does not meet the requirements",
            FailureCategory::Session => "The privileged session was lost",
            FailureCategory::Config => "The deployment configuration is invalid",
            FailureCategory::Script => "An installer script failed",
            FailureCategory::Unknown => "Deployment failed",
        }
    }
}

const NETWORK_PATTERNS: &[&str] = &[
    "could not resolve host",
    "temporary failure in name resolution",
    "name or service not known",
    "network is unreachable",
    "connection timed out",
    "connection refused",
    "failed to connect",
    "tls handshake timeout",
    "network check",
];

const DISK_PATTERNS: &[&str] = &["no space left on device", "disk space", "insufficient disk"];

const PERMISSION_PATTERNS: &[&str] = &["permission denied", "operation not permitted"];

/// Best-effort classification of free-form installer output
pub fn categorize_text(text: &str) -> Option<FailureCategory> {
    let lower = text.to_lowercase();
    if NETWORK_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Some(FailureCategory::Network);
    }
    if DISK_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Some(FailureCategory::DiskSpace);
    }
    if PERMISSION_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Some(FailureCategory::Permission);
    }
    None
}

/// Whether installer output points at a DNS or connectivity failure
pub fn looks_like_network_failure(text: &str) -> bool {
    categorize_text(text) == Some(FailureCategory::Network)
}
