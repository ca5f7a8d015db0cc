//! Finite state machine for a deployment run

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// Deployment phase, as published in status snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentPhase {
    /// No run in progress
    Idle,

    /// Environment checks, and later tool install plus cluster verification
    Preparing,

    /// Fetching the installer repository
    Cloning,

    /// Writing model parameters into the values file
    Configuring,

    /// Running the step table
    Deploying,

    Success,

    Error,
}

impl DeploymentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentPhase::Idle => "idle",
            DeploymentPhase::Preparing => "preparing",
            DeploymentPhase::Cloning => "cloning",
            DeploymentPhase::Configuring => "configuring",
            DeploymentPhase::Deploying => "deploying",
            DeploymentPhase::Success => "success",
            DeploymentPhase::Error => "error",
        }
    }

    /// Whether a run is in progress in this phase
    pub fn is_running(&self) -> bool {
        !matches!(
            self,
            DeploymentPhase::Idle | DeploymentPhase::Success | DeploymentPhase::Error
        )
    }
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// Start a run
    Start,

    /// Environment checks passed
    Checked,

    /// Installer repository is up to date
    Cloned,

    /// Values file written; tool install and cluster verification follow
    Configured,

    /// Cluster reports a ready node
    ClusterReady,

    /// Every step succeeded
    Completed,

    /// A phase failed
    Fail(String),

    /// The run was cancelled
    Cancel,

    /// Back to idle after a finished run
    Reset,
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    phase: DeploymentPhase,
    error: Option<String>,
    verifying: bool,
}

impl DeploymentFsm {
    /// Create a new FSM in idle state
    pub fn new() -> Self {
        Self {
            phase: DeploymentPhase::Idle,
            error: None,
            verifying: false,
        }
    }

    pub fn phase(&self) -> DeploymentPhase {
        self.phase
    }

    /// Error message of the failed run, if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Whether the second preparing pass (tools and cluster) is underway
    pub fn is_verifying(&self) -> bool {
        self.verifying
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<DeploymentPhase, DeployError> {
        use DeploymentEvent as E;
        use DeploymentPhase as P;

        let next = match (self.phase, &event) {
            (P::Idle, E::Start) => {
                self.error = None;
                self.verifying = false;
                P::Preparing
            }
            (P::Preparing, E::Checked) if !self.verifying => P::Cloning,
            (P::Cloning, E::Cloned) => P::Configuring,
            (P::Configuring, E::Configured) => {
                self.verifying = true;
                P::Preparing
            }
            (P::Preparing, E::ClusterReady) if self.verifying => P::Deploying,
            (P::Deploying, E::Completed) => P::Success,

            (phase, E::Fail(err)) if phase.is_running() => {
                self.error = Some(err.clone());
                P::Error
            }

            (_, E::Cancel) => {
                self.verifying = false;
                P::Idle
            }
            (P::Idle | P::Success | P::Error, E::Reset) => {
                self.error = None;
                self.verifying = false;
                P::Idle
            }

            (phase, event) => {
                return Err(DeployError::Internal(format!(
                    "Invalid transition: {} -> {:?}",
                    phase, event
                )));
            }
        };

        self.phase = next;
        Ok(next)
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
