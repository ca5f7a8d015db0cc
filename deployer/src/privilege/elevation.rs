//! Privilege elevation launcher

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::process::Command;

use crate::errors::{DeployError, PermissionReason};

const SHELL: &str = "/bin/bash";

/// How the worker (and the one-shot fallback) is launched.
///
/// An elevated launcher prefixes the shell with a graphical helper such as
/// `pkexec`. A direct launcher runs the shell as the current user, which is
/// what an already-privileged process and the test suite use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launcher {
    program: Option<String>,
    shell: String,
}

impl Launcher {
    pub fn elevated(program: &str) -> Self {
        Self {
            program: Some(program.to_string()),
            shell: SHELL.to_string(),
        }
    }

    pub fn direct() -> Self {
        Self {
            program: None,
            shell: "bash".to_string(),
        }
    }

    pub fn is_elevated(&self) -> bool {
        self.program.is_some()
    }

    /// Name used in log lines
    pub fn describe(&self) -> &str {
        self.program.as_deref().unwrap_or(&self.shell)
    }

    fn base_command(&self) -> Command {
        let mut cmd = match &self.program {
            Some(program) => {
                let mut cmd = Command::new(program);
                cmd.arg(&self.shell);
                cmd
            }
            None => Command::new(&self.shell),
        };
        cmd.kill_on_drop(true);
        cmd
    }

    /// Long-running worker: piped stdio, killed if the handle is dropped
    pub fn worker_command(&self, script: &Path) -> Command {
        let mut cmd = self.base_command();
        cmd.arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// One-shot invocation of a single command line
    pub fn one_shot_command(&self, line: &str) -> Command {
        let mut cmd = self.base_command();
        cmd.arg("-c")
            .arg(line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Map a failed launch to a specific reason.
    ///
    /// Exit codes follow the elevation helper's conventions: 126 when the
    /// credential dialog is dismissed, 127 when the helper cannot run the
    /// target, 1 when authorization is refused. A direct launcher has no such
    /// conventions, so its failures are plain lifecycle errors.
    pub fn classify_exit(&self, status: ExitStatus) -> DeployError {
        if !self.is_elevated() {
            return DeployError::ProcessLifecycleError(format!(
                "worker exited during startup ({})",
                status
            ));
        }
        match status.code() {
            Some(1) => DeployError::PermissionError(PermissionReason::Denied),
            Some(126) => DeployError::PermissionError(PermissionReason::AuthenticationAborted),
            Some(127) => DeployError::PermissionError(PermissionReason::CommandNotFound),
            _ => DeployError::ProcessLifecycleError(format!(
                "{} exited during startup ({})",
                self.describe(),
                status
            )),
        }
    }
}

/// Map a spawn failure to a specific reason
pub fn classify_spawn_error(err: io::Error) -> DeployError {
    match err.kind() {
        io::ErrorKind::NotFound => DeployError::PermissionError(PermissionReason::CommandNotFound),
        io::ErrorKind::PermissionDenied => DeployError::PermissionError(PermissionReason::Denied),
        _ => DeployError::ProcessLifecycleError(format!("failed to spawn worker: {}", err)),
    }
}
