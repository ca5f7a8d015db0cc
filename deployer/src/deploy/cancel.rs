//! Per-run cancellation token

use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Hands out one token per deployment run.
///
/// `begin` creates a fresh token unless a run already holds one, `cancel`
/// trips the current one, `finish` discards it so the next run starts clean.
#[derive(Debug, Default)]
pub struct CancellationGovernor {
    current: Mutex<Option<CancellationToken>>,
}

impl CancellationGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> Option<CancellationToken> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            return None;
        }
        let token = CancellationToken::new();
        *current = Some(token.clone());
        Some(token)
    }

    /// Cancel the current run. Returns false when no run holds a token.
    pub fn cancel(&self) -> bool {
        match self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(token) => {
                info!("Cancelling deployment");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn finish(&self) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}
