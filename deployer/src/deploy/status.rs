//! Deployment status snapshots and their broadcast channel

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::deploy::fsm::DeploymentPhase;

const CHANNEL_CAPACITY: usize = 64;

/// Full status snapshot pushed to every subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    pub status: DeploymentPhase,
    pub message: String,
    pub current_step: Option<String>,
    /// 0 to 100
    pub progress: u8,
    /// Remaining seconds, when known
    pub estimated_time: Option<u64>,
}

impl DeploymentStatus {
    pub fn idle() -> Self {
        Self {
            status: DeploymentPhase::Idle,
            message: String::new(),
            current_step: None,
            progress: 0,
            estimated_time: None,
        }
    }

    pub fn new(status: DeploymentPhase, message: impl Into<String>, progress: u8) -> Self {
        Self {
            status,
            message: message.into(),
            current_step: None,
            progress: progress.min(100),
            estimated_time: None,
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn with_estimate(mut self, seconds: u64) -> Self {
        self.estimated_time = Some(seconds);
        self
    }
}

impl Default for DeploymentStatus {
    fn default() -> Self {
        Self::idle()
    }
}

/// Holds the latest snapshot and fans it out to subscribers
pub struct StatusPublisher {
    current: Mutex<DeploymentStatus>,
    sender: broadcast::Sender<DeploymentStatus>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            current: Mutex::new(DeploymentStatus::idle()),
            sender,
        }
    }

    /// Receive every snapshot published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentStatus> {
        self.sender.subscribe()
    }

    pub fn current(&self) -> DeploymentStatus {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn publish(&self, status: DeploymentStatus) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = status.clone();
        // no subscribers is fine
        let _ = self.sender.send(status);
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}
