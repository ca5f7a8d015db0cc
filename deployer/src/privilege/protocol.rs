//! Line protocol spoken with the privileged worker.
//!
//! Every request is a single line of shell text. The worker answers with the
//! command's output followed by exactly one completion marker tagged with its
//! own pid, so replies from a worker that was just replaced are ignored:
//!
//! - `COMMAND_SUCCESS_<pid>`: the command exited zero
//! - `COMMAND_ERROR_<code>_<pid>`: the command exited non-zero
//! - `COMMAND_DONE_<pid>`: generic completion emitted by older worker scripts
//!
//! Standard error of a command is relayed as `COMMAND_STDERR_<pid>:<text>`
//! lines ahead of the marker so both streams arrive in order. Liveness probes
//! are `HEALTH_CHECK_<nonce>` and are answered with `HEALTH_CHECK_<nonce>_DONE`
//! independently of any running command.
//!
//! Markers are matched as substrings of the output stream. A command that
//! prints a matching string itself will be misparsed.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::errors::{looks_like_network_failure, DeployError, TimeoutOrigin};
use crate::utils::shell_quote;

/// Line that asks the worker to terminate
pub const EXIT_COMMAND: &str = "EXIT";

/// Exit status of the conventional `timeout` wrapper
pub const TIMEOUT_EXIT_CODE: i32 = 124;

pub(crate) const READY_PREFIX: &str = "WORKER_READY_";
const SUCCESS_PREFIX: &str = "COMMAND_SUCCESS_";
const ERROR_PREFIX: &str = "COMMAND_ERROR_";
const DONE_PREFIX: &str = "COMMAND_DONE_";
const STDERR_PREFIX: &str = "COMMAND_STDERR_";
const HEALTH_PREFIX: &str = "HEALTH_CHECK_";
const HEALTH_SUFFIX: &str = "_DONE";

/// Output lines kept per stream for a single command
const MAX_CAPTURED_LINES: usize = 2000;

/// Lines of stdout searched for a failure cause when stderr is empty
const FAILURE_TAIL_LINES: usize = 20;

/// A recognised marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    Ready { pid: u32 },
    Health { nonce: String },
    Success { pid: u32 },
    Error { code: i32, pid: u32 },
    Done { pid: u32 },
    Stderr { pid: u32, text: String },
}

/// One stdout line split into plain output and an optional trailing marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine<'a> {
    pub output: &'a str,
    pub marker: Option<Marker>,
}

/// Probe line for the given nonce
pub fn health_probe_line(nonce: &str) -> String {
    format!("{}{}", HEALTH_PREFIX, nonce)
}

/// Parse one line of worker stdout.
///
/// Health markers are checked first, then success, error and legacy done.
pub fn parse_line(line: &str) -> ParsedLine<'_> {
    let line = line.trim_end_matches(['\r', '\n']);

    if let Some(rest) = line.strip_prefix(STDERR_PREFIX) {
        if let Some((pid, text)) = rest.split_once(':') {
            if let Ok(pid) = pid.parse() {
                return ParsedLine {
                    output: "",
                    marker: Some(Marker::Stderr {
                        pid,
                        text: text.to_string(),
                    }),
                };
            }
        }
    }

    if let Some(rest) = line.strip_prefix(READY_PREFIX) {
        if let Ok(pid) = rest.trim().parse() {
            return ParsedLine {
                output: "",
                marker: Some(Marker::Ready { pid }),
            };
        }
    }

    let trailing: [(&str, fn(&str) -> Option<Marker>); 4] = [
        (HEALTH_PREFIX, parse_health),
        (SUCCESS_PREFIX, parse_success),
        (ERROR_PREFIX, parse_error),
        (DONE_PREFIX, parse_done),
    ];
    for (prefix, parse) in trailing {
        if let Some(idx) = line.rfind(prefix) {
            if let Some(marker) = parse(line[idx + prefix.len()..].trim_end()) {
                return ParsedLine {
                    output: &line[..idx],
                    marker: Some(marker),
                };
            }
        }
    }

    ParsedLine {
        output: line,
        marker: None,
    }
}

fn parse_health(tail: &str) -> Option<Marker> {
    let nonce = tail.strip_suffix(HEALTH_SUFFIX)?;
    if nonce.is_empty() || !nonce.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(Marker::Health {
        nonce: nonce.to_string(),
    })
}

fn parse_success(tail: &str) -> Option<Marker> {
    Some(Marker::Success {
        pid: tail.parse().ok()?,
    })
}

fn parse_error(tail: &str) -> Option<Marker> {
    let (code, pid) = tail.split_once('_')?;
    Some(Marker::Error {
        code: code.parse().ok()?,
        pid: pid.parse().ok()?,
    })
}

fn parse_done(tail: &str) -> Option<Marker> {
    Some(Marker::Done {
        pid: tail.parse().ok()?,
    })
}

/// Serialize a command and its environment overrides into one request line
pub fn render_command(command: &str, env: &BTreeMap<String, String>) -> Result<String, DeployError> {
    let command = command.trim();
    if command.is_empty() {
        return Err(DeployError::ValidationError("empty command".to_string()));
    }
    if command.contains(['\n', '\r']) {
        return Err(DeployError::ValidationError(
            "commands must fit on a single line".to_string(),
        ));
    }
    if command == EXIT_COMMAND || command.starts_with(HEALTH_PREFIX) {
        return Err(DeployError::ValidationError(format!(
            "'{}' is reserved by the worker protocol",
            command
        )));
    }

    let mut line = String::new();
    for (name, value) in env {
        let valid_name = !name.is_empty()
            && !name.starts_with(|c: char| c.is_ascii_digit())
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_name {
            return Err(DeployError::ValidationError(format!(
                "invalid environment variable name '{}'",
                name
            )));
        }
        if value.contains(['\n', '\r']) {
            return Err(DeployError::ValidationError(format!(
                "environment variable '{}' must fit on a single line",
                name
            )));
        }
        line.push_str(&format!("export {}={}; ", name, shell_quote(value)));
    }
    line.push_str(command);
    Ok(line)
}

/// How a dispatched command ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Success { stdout: String },
    Failed { code: i32, stdout: String, stderr: String },
    Done { stdout: String },
    Aborted,
    WorkerExited,
}

impl CommandOutcome {
    /// Build an outcome from a plain process exit, as used outside the worker
    pub fn from_exit(code: Option<i32>, stdout: String, stderr: String) -> Self {
        match code {
            Some(0) => CommandOutcome::Success { stdout },
            Some(code) => CommandOutcome::Failed { code, stdout, stderr },
            None => CommandOutcome::Failed {
                code: -1,
                stdout,
                stderr: if stderr.is_empty() {
                    "terminated by signal".to_string()
                } else {
                    stderr
                },
            },
        }
    }

    /// Convert into the caller-facing result
    pub fn into_result(self) -> Result<String, DeployError> {
        match self {
            CommandOutcome::Success { stdout } | CommandOutcome::Done { stdout } => Ok(stdout),
            CommandOutcome::Failed {
                code: TIMEOUT_EXIT_CODE,
                ..
            } => Err(DeployError::CommandTimeoutError {
                step: None,
                origin: TimeoutOrigin::Worker,
                timeout: Duration::ZERO,
            }),
            CommandOutcome::Failed {
                code,
                stdout,
                stderr,
            } => {
                let evidence = if stderr.trim().is_empty() {
                    tail_lines(&stdout, FAILURE_TAIL_LINES)
                } else {
                    stderr
                };
                if looks_like_network_failure(&evidence) {
                    Err(DeployError::NetworkError(evidence))
                } else {
                    Err(DeployError::ScriptError {
                        code,
                        stderr: evidence,
                    })
                }
            }
            CommandOutcome::Aborted => Err(DeployError::Aborted),
            CommandOutcome::WorkerExited => Err(DeployError::ProcessLifecycleError(
                "worker exited before the command completed".to_string(),
            )),
        }
    }
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

/// The single in-flight command
#[derive(Debug)]
pub struct PendingCommand {
    command: String,
    stdout: VecDeque<String>,
    stderr: VecDeque<String>,
    slot: oneshot::Sender<CommandOutcome>,
}

impl PendingCommand {
    fn resolve(self, outcome: impl FnOnce(String, String) -> CommandOutcome) {
        let stdout = join_lines(&self.stdout);
        let stderr = join_lines(&self.stderr);
        let _ = self.slot.send(outcome(stdout, stderr));
    }
}

fn join_lines(lines: &VecDeque<String>) -> String {
    lines
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

fn push_capped(lines: &mut VecDeque<String>, line: &str) {
    if lines.len() == MAX_CAPTURED_LINES {
        lines.pop_front();
    }
    lines.push_back(line.to_string());
}

/// What a stdout line did to the protocol state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEffect {
    Ready(u32),
    HealthAnswered(String),
    Resolved,
    Output,
    Ignored,
}

/// Reply-matching state shared by the worker's reader tasks and the session
#[derive(Debug, Default)]
pub struct ProtocolState {
    worker_pid: Option<u32>,
    ready_waiter: Option<oneshot::Sender<u32>>,
    pending: Option<PendingCommand>,
    health_waiters: HashMap<String, oneshot::Sender<()>>,
    closed: bool,
}

impl ProtocolState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pid announced by the worker in its startup marker
    pub fn worker_pid(&self) -> Option<u32> {
        self.worker_pid
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Resolves with the worker pid once the startup marker is seen
    pub fn await_ready(&mut self) -> oneshot::Receiver<u32> {
        let (tx, rx) = oneshot::channel();
        match self.worker_pid {
            Some(pid) => {
                let _ = tx.send(pid);
            }
            None => self.ready_waiter = Some(tx),
        }
        rx
    }

    /// Register the next command. Only one command may be in flight.
    pub fn begin(
        &mut self,
        command: String,
    ) -> Result<oneshot::Receiver<CommandOutcome>, DeployError> {
        if self.closed {
            return Err(DeployError::ProcessLifecycleError(
                "worker output stream is closed".to_string(),
            ));
        }
        if self.pending.is_some() {
            return Err(DeployError::CommandInFlight);
        }

        let (slot, rx) = oneshot::channel();
        self.pending = Some(PendingCommand {
            command,
            stdout: VecDeque::new(),
            stderr: VecDeque::new(),
            slot,
        });
        Ok(rx)
    }

    /// Register a liveness probe waiter
    pub fn register_health(&mut self, nonce: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.health_waiters.insert(nonce.to_string(), tx);
        rx
    }

    pub fn forget_health(&mut self, nonce: &str) {
        self.health_waiters.remove(nonce);
    }

    fn owns(&self, pid: u32) -> bool {
        self.worker_pid == Some(pid)
    }

    fn push_output(&mut self, output: &str) -> bool {
        match self.pending.as_mut() {
            Some(pending) if !output.is_empty() => {
                push_capped(&mut pending.stdout, output);
                true
            }
            _ => false,
        }
    }

    /// Feed one line of worker stdout
    pub fn on_stdout_line(&mut self, line: &str) -> LineEffect {
        let parsed = parse_line(line);
        let marker = match parsed.marker {
            Some(marker) => marker,
            None => {
                return if self.push_output(parsed.output) {
                    LineEffect::Output
                } else {
                    LineEffect::Ignored
                };
            }
        };

        match marker {
            Marker::Ready { pid } => {
                if self.worker_pid.is_some() {
                    return LineEffect::Ignored;
                }
                self.worker_pid = Some(pid);
                if let Some(waiter) = self.ready_waiter.take() {
                    let _ = waiter.send(pid);
                }
                LineEffect::Ready(pid)
            }
            Marker::Health { nonce } => {
                self.push_output(parsed.output);
                match self.health_waiters.remove(&nonce) {
                    Some(waiter) => {
                        let _ = waiter.send(());
                        LineEffect::HealthAnswered(nonce)
                    }
                    None => LineEffect::Ignored,
                }
            }
            Marker::Stderr { pid, text } => match self.pending.as_mut() {
                Some(pending) if self.worker_pid == Some(pid) => {
                    push_capped(&mut pending.stderr, &text);
                    LineEffect::Output
                }
                _ => LineEffect::Ignored,
            },
            Marker::Success { pid } | Marker::Error { pid, .. } | Marker::Done { pid } => {
                self.push_output(parsed.output);
                if !self.owns(pid) {
                    debug!("Ignoring completion marker from stale worker pid {}", pid);
                    return LineEffect::Ignored;
                }
                let Some(pending) = self.pending.take() else {
                    debug!("Ignoring completion marker with no command in flight");
                    return LineEffect::Ignored;
                };
                match marker {
                    Marker::Success { .. } => {
                        pending.resolve(|stdout, _| CommandOutcome::Success { stdout })
                    }
                    Marker::Error { code, .. } => pending.resolve(|stdout, stderr| {
                        CommandOutcome::Failed {
                            code,
                            stdout,
                            stderr,
                        }
                    }),
                    _ => pending.resolve(|stdout, _| CommandOutcome::Done { stdout }),
                }
                LineEffect::Resolved
            }
        }
    }

    /// Feed one line the worker itself wrote to stderr
    pub fn on_stderr_line(&mut self, line: &str) {
        match self.pending.as_mut() {
            Some(pending) => push_capped(&mut pending.stderr, line),
            None => debug!("worker stderr: {}", line),
        }
    }

    /// Drop the in-flight command after its deadline, returning its text
    pub fn expire(&mut self) -> Option<String> {
        self.pending.take().map(|pending| pending.command)
    }

    /// Reject every waiter with an aborted outcome
    pub fn abort_all(&mut self) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.slot.send(CommandOutcome::Aborted);
        }
        self.health_waiters.clear();
        self.ready_waiter = None;
    }

    /// The worker's stdout reached end of file
    pub fn on_closed(&mut self) {
        self.closed = true;
        if let Some(pending) = self.pending.take() {
            let _ = pending.slot.send(CommandOutcome::WorkerExited);
        }
        self.health_waiters.clear();
        self.ready_waiter = None;
    }
}
