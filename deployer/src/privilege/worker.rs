//! Privileged worker process

use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::privilege::elevation::{classify_spawn_error, Launcher};
use crate::privilege::protocol::{
    health_probe_line, CommandOutcome, LineEffect, ProtocolState, EXIT_COMMAND,
};
use crate::privilege::shutdown::{
    send_terminate, ShutdownAction, ShutdownOptions, ShutdownSequence, ShutdownState,
};

/// The worker script.
///
/// Each request runs in the background, in its own session where `setsid` is
/// available, so the read loop keeps answering health probes while a slow
/// installer is running. Standard error is captured to a file and replayed
/// ahead of the completion marker. A new request arriving while an older one
/// is still tracked means the controller gave up on the older one; it is
/// killed without emitting a marker.
pub const WORKER_SCRIPT: &str = r#"#!/bin/bash
worker_pid=$$
err_file="$(mktemp "${TMPDIR:-/tmp}/stackdeploy-stderr.XXXXXX")" || exit 70
cmd_pid=""
buffer=""

start_command() {
    if command -v setsid >/dev/null 2>&1; then
        setsid bash -c "$1" 2>"$err_file" </dev/null &
    else
        ( eval "$1" ) 2>"$err_file" </dev/null &
    fi
    cmd_pid=$!
}

finish_command() {
    wait "$cmd_pid"
    local code=$?
    local err_line
    cmd_pid=""
    # markers must start a line even after output without a trailing newline
    printf '\n'
    while IFS= read -r err_line || [ -n "$err_line" ]; do
        printf 'COMMAND_STDERR_%s:%s\n' "$worker_pid" "$err_line"
    done < "$err_file"
    : > "$err_file"
    if [ "$code" -eq 0 ]; then
        printf 'COMMAND_SUCCESS_%s\n' "$worker_pid"
    else
        printf 'COMMAND_ERROR_%s_%s\n' "$code" "$worker_pid"
    fi
}

reap_command() {
    if [ -n "$cmd_pid" ] && ! kill -0 "$cmd_pid" 2>/dev/null; then
        finish_command
    fi
}

# Stop a command the controller no longer waits for, without a marker
discard_command() {
    if [ -z "$cmd_pid" ]; then
        return
    fi
    kill -TERM -- "-$cmd_pid" 2>/dev/null || kill -TERM "$cmd_pid" 2>/dev/null
    wait "$cmd_pid" 2>/dev/null
    cmd_pid=""
    : > "$err_file"
}

cleanup() {
    discard_command
    rm -f "$err_file"
}
trap cleanup EXIT
trap 'exit 143' TERM

printf 'WORKER_READY_%s\n' "$worker_pid"

while true; do
    line=""
    IFS= read -r -t 0.2 line
    status=$?
    if [ "$status" -gt 128 ]; then
        buffer="$buffer$line"
        reap_command
        continue
    fi
    line="$buffer$line"
    buffer=""
    if [ "$status" -ne 0 ] && [ -z "$line" ]; then
        break
    fi
    case "$line" in
        EXIT)
            break
            ;;
        HEALTH_CHECK_*)
            printf '%s_DONE\n' "$line"
            ;;
        "")
            ;;
        *)
            discard_command
            start_command "$line"
            ;;
    esac
    reap_command
done
"#;

const SCRIPT_FILE_NAME: &str = "worker.sh";

/// Protocol state shared with the reader tasks
pub type SharedProtocol = Arc<Mutex<ProtocolState>>;

/// Lock the protocol state. A panicked reader leaves the state usable.
pub fn lock(protocol: &SharedProtocol) -> MutexGuard<'_, ProtocolState> {
    protocol.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Startup {
    Ready(u32),
    OutputClosed,
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Handle on a running worker
pub struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    protocol: SharedProtocol,
    readers: Vec<JoinHandle<()>>,
    script_dir: Dir,
    pid: u32,
}

impl WorkerProcess {
    /// Materialize the script, launch it and wait for the ready marker
    pub async fn spawn(
        launcher: &Launcher,
        script: &str,
        startup_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self, DeployError> {
        let script_dir = Dir::create_private_temp("stackdeploy-worker").await?;
        let script_file = script_dir.file(SCRIPT_FILE_NAME);
        script_file.write_string(script).await?;
        script_file.set_mode(0o700).await?;

        info!(
            "Launching privileged worker via {} ({})",
            launcher.describe(),
            script_file.path().display()
        );
        let mut child = match launcher.worker_command(script_file.path()).spawn() {
            Ok(child) => child,
            Err(e) => {
                remove_script_dir(&script_dir).await;
                return Err(classify_spawn_error(e));
            }
        };

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.start_kill();
                remove_script_dir(&script_dir).await;
                return Err(DeployError::Internal(
                    "worker stdio was not captured".to_string(),
                ));
            }
        };

        let protocol: SharedProtocol = Arc::new(Mutex::new(ProtocolState::new()));
        let ready = lock(&protocol).await_ready();
        let readers = vec![
            spawn_reader(stdout, protocol.clone(), Stream::Stdout),
            spawn_reader(stderr, protocol.clone(), Stream::Stderr),
        ];

        let startup = tokio::select! {
            pid = ready => match pid {
                Ok(pid) => Startup::Ready(pid),
                Err(_) => Startup::OutputClosed,
            },
            status = child.wait() => Startup::Exited(status),
            _ = sleep(startup_timeout) => Startup::TimedOut,
            _ = cancel.cancelled() => Startup::Cancelled,
        };

        let pid = match startup {
            Startup::Ready(pid) => pid,
            failure => {
                let err = match failure {
                    Startup::Exited(Ok(status)) => launcher.classify_exit(status),
                    Startup::Exited(Err(e)) => DeployError::IoError(e),
                    // stdout closes just before the exit status is available
                    Startup::OutputClosed => match timeout(Duration::from_secs(1), child.wait()).await {
                        Ok(Ok(status)) => launcher.classify_exit(status),
                        _ => DeployError::ProcessLifecycleError(
                            "worker closed its output before signalling ready".to_string(),
                        ),
                    },
                    Startup::TimedOut => DeployError::ProcessLifecycleError(format!(
                        "worker did not become ready within {}s",
                        startup_timeout.as_secs()
                    )),
                    Startup::Cancelled | Startup::Ready(_) => DeployError::Aborted,
                };
                let _ = child.start_kill();
                let _ = timeout(Duration::from_secs(1), child.wait()).await;
                for reader in &readers {
                    reader.abort();
                }
                remove_script_dir(&script_dir).await;
                return Err(err);
            }
        };

        info!("Privileged worker ready (pid {})", pid);
        Ok(Self {
            child,
            stdin,
            protocol,
            readers,
            script_dir,
            pid,
        })
    }

    /// Pid the worker reported in its ready marker
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn protocol(&self) -> SharedProtocol {
        self.protocol.clone()
    }

    /// Whether the process has exited or its output stream is gone
    pub fn has_exited(&mut self) -> bool {
        if lock(&self.protocol).is_closed() {
            return true;
        }
        !matches!(self.child.try_wait(), Ok(None))
    }

    async fn send_line(&mut self, line: &str) -> Result<(), DeployError> {
        trace!("worker <- {}", line);
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        let write = async {
            self.stdin.write_all(&bytes).await?;
            self.stdin.flush().await
        };
        write.await.map_err(|e| {
            DeployError::ProcessLifecycleError(format!("failed to write to worker: {}", e))
        })
    }

    /// Register a command and write it to the worker
    pub async fn dispatch(
        &mut self,
        line: String,
    ) -> Result<oneshot::Receiver<CommandOutcome>, DeployError> {
        let rx = lock(&self.protocol).begin(line.clone())?;
        if let Err(e) = self.send_line(&line).await {
            lock(&self.protocol).expire();
            return Err(e);
        }
        Ok(rx)
    }

    /// Send a nonced liveness probe and wait for its answer
    pub async fn probe(&mut self, nonce: &str, wait: Duration) -> bool {
        let rx = lock(&self.protocol).register_health(nonce);
        if let Err(e) = self.send_line(&health_probe_line(nonce)).await {
            debug!("Health probe could not be sent: {}", e);
            lock(&self.protocol).forget_health(nonce);
            return false;
        }
        let answered = matches!(timeout(wait, rx).await, Ok(Ok(())));
        if !answered {
            lock(&self.protocol).forget_health(nonce);
        }
        answered
    }

    /// Tear the worker down: EXIT, then terminate, then kill
    pub async fn shutdown(mut self, options: &ShutdownOptions) {
        let mut sequence = ShutdownSequence::new(options.clone());
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            sequence.advance(true);
        }

        while !sequence.is_done() {
            match sequence.action() {
                ShutdownAction::SendExit => {
                    if let Err(e) = self.send_line(EXIT_COMMAND).await {
                        debug!("EXIT not delivered: {}", e);
                    }
                }
                ShutdownAction::Terminate => {
                    if let Some(os_pid) = self.child.id() {
                        debug!("Sending SIGTERM to worker {}", os_pid);
                        if let Err(e) = send_terminate(os_pid) {
                            debug!("SIGTERM failed: {}", e);
                        }
                    }
                }
                ShutdownAction::Kill => {
                    warn!("Worker {} did not exit, killing it", self.pid);
                    if let Err(e) = self.child.start_kill() {
                        debug!("kill failed: {}", e);
                    }
                }
                ShutdownAction::Done => break,
            }

            let exited = matches!(
                timeout(sequence.wait_budget(), self.child.wait()).await,
                Ok(Ok(_))
            );
            let previous = sequence.state();
            if sequence.advance(exited) == ShutdownState::Exited
                && !exited
                && previous == ShutdownState::Forced
            {
                warn!("Worker {} survived the kill signal, abandoning it", self.pid);
            }
        }

        lock(&self.protocol).on_closed();
        for reader in &self.readers {
            reader.abort();
        }
        remove_script_dir(&self.script_dir).await;
        info!("Privileged worker {} stopped", self.pid);
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn spawn_reader<R>(stream: R, protocol: SharedProtocol, kind: Stream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\r', '\n']);
                    match kind {
                        Stream::Stdout => {
                            let effect = lock(&protocol).on_stdout_line(line);
                            if effect != LineEffect::Output {
                                trace!("worker -> {} ({:?})", line, effect);
                            }
                        }
                        Stream::Stderr => lock(&protocol).on_stderr_line(line),
                    }
                }
                Err(e) => {
                    warn!("Failed to read worker {:?}: {}", kind, e);
                    break;
                }
            }
        }
        if let Stream::Stdout = kind {
            lock(&protocol).on_closed();
        }
    })
}

async fn remove_script_dir(dir: &Dir) {
    if let Err(e) = dir.delete().await {
        warn!("Failed to remove worker script dir {}: {}", dir.path().display(), e);
    }
}
