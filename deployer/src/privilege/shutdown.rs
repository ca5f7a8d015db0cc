//! Worker teardown as an explicit state sequence.
//!
//! `Requested` asks the worker to exit over its input stream, `GracefulWait`
//! sends a terminate signal, `Forced` kills it. Each state has a wait budget;
//! the driver performs the state's action, waits up to the budget for the
//! process to exit and then advances.

use std::time::Duration;

/// Shutdown sequence state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Requested,
    GracefulWait,
    Forced,
    Exited,
}

/// Action the driver performs when entering a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownAction {
    SendExit,
    Terminate,
    Kill,
    Done,
}

/// Grace periods between escalation steps
#[derive(Debug, Clone)]
pub struct ShutdownOptions {
    pub exit_grace: Duration,
    pub terminate_grace: Duration,
    pub kill_grace: Duration,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            exit_grace: Duration::from_secs(1),
            terminate_grace: Duration::from_secs(2),
            kill_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSequence {
    state: ShutdownState,
    options: ShutdownOptions,
}

impl ShutdownSequence {
    pub fn new(options: ShutdownOptions) -> Self {
        Self {
            state: ShutdownState::Requested,
            options,
        }
    }

    pub fn state(&self) -> ShutdownState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == ShutdownState::Exited
    }

    pub fn action(&self) -> ShutdownAction {
        match self.state {
            ShutdownState::Requested => ShutdownAction::SendExit,
            ShutdownState::GracefulWait => ShutdownAction::Terminate,
            ShutdownState::Forced => ShutdownAction::Kill,
            ShutdownState::Exited => ShutdownAction::Done,
        }
    }

    /// How long to wait for the process after the current action
    pub fn wait_budget(&self) -> Duration {
        match self.state {
            ShutdownState::Requested => self.options.exit_grace,
            ShutdownState::GracefulWait => self.options.terminate_grace,
            ShutdownState::Forced => self.options.kill_grace,
            ShutdownState::Exited => Duration::ZERO,
        }
    }

    /// Move on after waiting. A process that survives a kill is abandoned.
    pub fn advance(&mut self, exited: bool) -> ShutdownState {
        self.state = if exited {
            ShutdownState::Exited
        } else {
            match self.state {
                ShutdownState::Requested => ShutdownState::GracefulWait,
                ShutdownState::GracefulWait => ShutdownState::Forced,
                ShutdownState::Forced | ShutdownState::Exited => ShutdownState::Exited,
            }
        };
        self.state
    }
}

/// Send SIGTERM to a process. Errors (already gone, not permitted) are returned.
#[cfg(unix)]
pub fn send_terminate(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
pub fn send_terminate(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "terminate signal is not available on this platform",
    ))
}
