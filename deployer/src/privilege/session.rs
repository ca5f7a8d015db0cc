//! Privileged session manager.
//!
//! Owns the one elevated worker of a deployment run. `start` launches it once
//! (or marks the session active without a subprocess when the process is
//! already root), `execute` funnels commands through it one at a time, a
//! background monitor probes it periodically, and `restart`/`stop` manage its
//! lifecycle. When the worker dies and cannot be restarted, the command that
//! was in flight may run once through a one-shot elevation instead.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{DeployError, TimeoutOrigin};
use crate::privilege::elevation::{classify_spawn_error, Launcher};
use crate::privilege::protocol::{render_command, CommandOutcome};
use crate::privilege::shutdown::ShutdownOptions;
use crate::privilege::worker::{lock, WorkerProcess, WORKER_SCRIPT};
use crate::utils::{calc_linear_backoff, generate_nonce, is_superuser};

/// Session manager options
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Time allowed for credential entry and the ready marker
    pub startup_timeout: Duration,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    /// Outstanding commands older than this are logged as slow
    pub slow_command_warning: Duration,
    pub restart_attempts: u32,
    /// Attempt n waits n times this before relaunching
    pub restart_backoff: Duration,
    /// Pause between tearing the old worker down and the first attempt
    pub restart_settle: Duration,
    pub default_command_timeout: Duration,
    pub max_command_timeout: Duration,
    pub launcher: Launcher,
    pub fallback_launcher: Launcher,
    /// Skip the worker entirely and run commands directly
    pub superuser: bool,
    pub enable_fallback: bool,
    pub shutdown: ShutdownOptions,
    /// Replacement worker script
    pub worker_script: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(120),
            health_check_interval: Duration::from_secs(60),
            health_check_timeout: Duration::from_secs(10),
            slow_command_warning: Duration::from_secs(20 * 60),
            restart_attempts: 3,
            restart_backoff: Duration::from_secs(2),
            restart_settle: Duration::from_secs(1),
            default_command_timeout: Duration::from_secs(60),
            max_command_timeout: Duration::from_secs(600),
            launcher: Launcher::elevated("pkexec"),
            fallback_launcher: Launcher::elevated("pkexec"),
            superuser: is_superuser(),
            enable_fallback: cfg!(target_os = "linux"),
            shutdown: ShutdownOptions::default(),
            worker_script: None,
        }
    }
}

/// Result of one background health cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Inactive session, direct mode, or a command is outstanding
    Skipped,
    /// A command has been outstanding past the slow-command threshold
    SlowCommand(Duration),
    Healthy,
    Restarted,
    Failed,
}

enum Mode {
    Inactive,
    Direct,
    Worker(WorkerProcess),
}

enum Dispatch {
    Finished(CommandOutcome),
    WorkerLost(String),
}

struct ExecutionGuard<'a> {
    manager: &'a SessionManager,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        *self
            .manager
            .command_started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.manager.executing.store(false, Ordering::SeqCst);
    }
}

/// Owner of the privileged worker
pub struct SessionManager {
    options: SessionOptions,
    mode: Mutex<Mode>,
    active: AtomicBool,
    pid: AtomicU32,
    started_at: StdMutex<Option<DateTime<Utc>>>,
    executing: AtomicBool,
    command_started_at: StdMutex<Option<Instant>>,
    restarts: AtomicU32,
    monitor: StdMutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl SessionManager {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            options,
            mode: Mutex::new(Mode::Inactive),
            active: AtomicBool::new(false),
            pid: AtomicU32::new(0),
            started_at: StdMutex::new(None),
            executing: AtomicBool::new(false),
            command_started_at: StdMutex::new(None),
            restarts: AtomicU32::new(0),
            monitor: StdMutex::new(None),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Pid reported by the running worker. `None` in direct mode.
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn is_command_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    fn script(&self) -> &str {
        self.options.worker_script.as_deref().unwrap_or(WORKER_SCRIPT)
    }

    fn mark_active(&self, pid: Option<u32>) {
        self.pid.store(pid.unwrap_or(0), Ordering::SeqCst);
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        self.active.store(true, Ordering::SeqCst);
    }

    fn mark_inactive(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.pid.store(0, Ordering::SeqCst);
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Establish the session. Idempotent while the session is active.
    pub async fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), DeployError> {
        let mut mode = self.lock_mode(cancel).await?;
        if !matches!(*mode, Mode::Inactive) {
            debug!("Privileged session already active");
            return Ok(());
        }

        if self.options.superuser {
            info!("Already running as superuser, commands run directly");
            *mode = Mode::Direct;
            self.mark_active(None);
            return Ok(());
        }

        let worker = WorkerProcess::spawn(
            &self.options.launcher,
            self.script(),
            self.options.startup_timeout,
            cancel,
        )
        .await?;
        self.mark_active(Some(worker.pid()));
        *mode = Mode::Worker(worker);
        drop(mode);

        self.start_monitor();
        Ok(())
    }

    /// Activate without a worker. Commands run with the caller's own rights.
    pub async fn start_direct(&self) {
        let mut mode = self.mode.lock().await;
        if matches!(*mode, Mode::Inactive) {
            info!("Privilege elevation not required, commands run directly");
            *mode = Mode::Direct;
            self.mark_active(None);
        }
    }

    fn start_monitor(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.options.health_check_interval;
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = sleep(interval) => {}
                }
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let verdict = manager.run_health_cycle(&task_token).await;
                debug!("Health cycle: {:?}", verdict);
            }
            debug!("Health monitor stopped");
        });
        *monitor = Some((handle, token));
    }

    fn begin_execution(&self) -> Result<ExecutionGuard<'_>, DeployError> {
        if self
            .executing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DeployError::CommandInFlight);
        }
        *self
            .command_started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        Ok(ExecutionGuard { manager: self })
    }

    /// Wait for the worker, giving up as soon as the run is cancelled.
    /// A restart holds the worker across its whole backoff.
    async fn lock_mode(
        &self,
        cancel: &CancellationToken,
    ) -> Result<MutexGuard<'_, Mode>, DeployError> {
        tokio::select! {
            mode = self.mode.lock() => Ok(mode),
            _ = cancel.cancelled() => Err(DeployError::Aborted),
        }
    }

    fn command_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(t) if !t.is_zero() => t.min(self.options.max_command_timeout),
            _ => self.options.default_command_timeout,
        }
    }

    /// Run one command with elevated rights and return its standard output.
    ///
    /// Fails fast with `CommandInFlight` while another command is outstanding.
    pub async fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<String, DeployError> {
        if !self.is_active() {
            return Err(DeployError::SessionInactive);
        }
        let line = render_command(command, env)?;
        let timeout = self.command_timeout(timeout);
        let _guard = self.begin_execution()?;
        if cancel.is_cancelled() {
            return Err(DeployError::Aborted);
        }

        if matches!(*self.lock_mode(cancel).await?, Mode::Direct) {
            debug!("Running directly: {}", command);
            return self
                .run_one_shot(&Launcher::direct(), &line, timeout, cancel)
                .await;
        }

        if !self.probe_worker(cancel).await? {
            warn!("Worker failed the pre-command health check, restarting");
            if let Err(e) = self.restart(cancel).await {
                return self.fallback(&line, timeout, cancel, e).await;
            }
        }

        debug!("Dispatching privileged command: {}", command);
        match self.dispatch_and_wait(&line, timeout, cancel).await? {
            Dispatch::Finished(outcome) => outcome.into_result(),
            Dispatch::WorkerLost(reason) => {
                warn!("Worker lost during command ({}), restarting", reason);
                if let Err(e) = self.restart(cancel).await {
                    return self.fallback(&line, timeout, cancel, e).await;
                }
                match self.dispatch_and_wait(&line, timeout, cancel).await? {
                    Dispatch::Finished(outcome) => outcome.into_result(),
                    Dispatch::WorkerLost(reason) => Err(DeployError::ProcessLifecycleError(reason)),
                }
            }
        }
    }

    async fn probe_worker(&self, cancel: &CancellationToken) -> Result<bool, DeployError> {
        let mut mode = self.lock_mode(cancel).await?;
        let healthy = match &mut *mode {
            Mode::Worker(worker) => {
                !worker.has_exited()
                    && worker
                        .probe(&generate_nonce(), self.options.health_check_timeout)
                        .await
            }
            Mode::Direct => true,
            Mode::Inactive => false,
        };
        Ok(healthy)
    }

    async fn dispatch_and_wait(
        &self,
        line: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Dispatch, DeployError> {
        let (rx, protocol) = {
            let mut mode = self.lock_mode(cancel).await?;
            let Mode::Worker(worker) = &mut *mode else {
                return Ok(Dispatch::WorkerLost("no worker is running".to_string()));
            };
            match worker.dispatch(line.to_string()).await {
                Ok(rx) => (rx, worker.protocol()),
                Err(DeployError::ProcessLifecycleError(reason)) => {
                    return Ok(Dispatch::WorkerLost(reason))
                }
                Err(e) => return Err(e),
            }
        };

        tokio::select! {
            outcome = rx => match outcome {
                Ok(CommandOutcome::WorkerExited) | Err(_) => Ok(Dispatch::WorkerLost(
                    "worker exited before the command completed".to_string(),
                )),
                Ok(outcome) => Ok(Dispatch::Finished(outcome)),
            },
            _ = sleep(timeout) => {
                if let Some(command) = lock(&protocol).expire() {
                    warn!("Command timed out after {}s: {}", timeout.as_secs(), command);
                }
                Err(DeployError::CommandTimeoutError {
                    step: None,
                    origin: TimeoutOrigin::Deadline,
                    timeout,
                })
            }
            _ = cancel.cancelled() => {
                lock(&protocol).abort_all();
                Err(DeployError::Aborted)
            }
        }
    }

    async fn fallback(
        &self,
        line: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        cause: DeployError,
    ) -> Result<String, DeployError> {
        if cause.is_aborted() || !self.options.enable_fallback {
            return Err(cause);
        }
        warn!(
            "Worker could not be restarted ({}), running the command through a one-shot elevation",
            cause
        );
        self.run_one_shot(&self.options.fallback_launcher, line, timeout, cancel)
            .await
    }

    async fn run_one_shot(
        &self,
        launcher: &Launcher,
        line: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, DeployError> {
        let child = launcher
            .one_shot_command(line)
            .spawn()
            .map_err(classify_spawn_error)?;

        // dropping the child on timeout or cancel kills it
        tokio::select! {
            output = child.wait_with_output() => {
                let output = output?;
                let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
                CommandOutcome::from_exit(output.status.code(), stdout, stderr).into_result()
            }
            _ = sleep(timeout) => Err(DeployError::CommandTimeoutError {
                step: None,
                origin: TimeoutOrigin::Deadline,
                timeout,
            }),
            _ = cancel.cancelled() => Err(DeployError::Aborted),
        }
    }

    /// Replace the worker, retrying the launch with linear backoff
    pub async fn restart(&self, cancel: &CancellationToken) -> Result<(), DeployError> {
        let count = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Restarting privileged worker (restart #{})", count);

        let mut mode = self.lock_mode(cancel).await?;
        if let Mode::Worker(worker) = std::mem::replace(&mut *mode, Mode::Inactive) {
            lock(&worker.protocol()).abort_all();
            worker.shutdown(&self.options.shutdown).await;
        }
        self.mark_inactive();

        tokio::select! {
            _ = sleep(self.options.restart_settle) => {}
            _ = cancel.cancelled() => return Err(DeployError::Aborted),
        }

        let attempts = self.options.restart_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let delay = calc_linear_backoff(self.options.restart_backoff, attempt);
            debug!("Restart attempt {}/{} in {:?}", attempt, attempts, delay);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled() => return Err(DeployError::Aborted),
            }

            match WorkerProcess::spawn(
                &self.options.launcher,
                self.script(),
                self.options.startup_timeout,
                cancel,
            )
            .await
            {
                Ok(worker) => {
                    self.mark_active(Some(worker.pid()));
                    *mode = Mode::Worker(worker);
                    info!("Privileged worker restarted on attempt {}", attempt);
                    return Ok(());
                }
                Err(e) if e.is_aborted() => return Err(e),
                Err(e) => {
                    warn!("Restart attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt was made".to_string());
        error!("Privileged worker could not be restarted: {}", reason);
        Err(DeployError::ProcessLifecycleError(format!(
            "worker could not be restarted after {} attempts: {}",
            attempts, reason
        )))
    }

    /// Tear the session down. Safe to call repeatedly.
    pub async fn stop(&self) {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((handle, token)) = monitor {
            token.cancel();
            handle.abort();
        }

        let mut mode = self.mode.lock().await;
        let previous = std::mem::replace(&mut *mode, Mode::Inactive);
        self.mark_inactive();
        match previous {
            Mode::Worker(worker) => {
                lock(&worker.protocol()).abort_all();
                worker.shutdown(&self.options.shutdown).await;
            }
            Mode::Direct => info!("Direct privileged session closed"),
            Mode::Inactive => {}
        }
    }

    /// One health cycle: probe an idle worker and restart it if unresponsive
    pub async fn run_health_cycle(&self, cancel: &CancellationToken) -> HealthVerdict {
        if !self.is_active() {
            return HealthVerdict::Skipped;
        }

        if self.is_command_executing() {
            let started = *self
                .command_started_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(started) = started {
                let elapsed = started.elapsed();
                if elapsed > self.options.slow_command_warning {
                    warn!(
                        "Privileged command outstanding for {}s, still waiting",
                        elapsed.as_secs()
                    );
                    return HealthVerdict::SlowCommand(elapsed);
                }
            }
            return HealthVerdict::Skipped;
        }

        let healthy = {
            let Ok(mut mode) = self.lock_mode(cancel).await else {
                return HealthVerdict::Skipped;
            };
            match &mut *mode {
                Mode::Worker(worker) => {
                    !worker.has_exited()
                        && worker
                            .probe(&generate_nonce(), self.options.health_check_timeout)
                            .await
                }
                Mode::Direct | Mode::Inactive => return HealthVerdict::Skipped,
            }
        };

        if healthy {
            return HealthVerdict::Healthy;
        }

        warn!("Privileged worker failed its health check, restarting");
        match self.restart(cancel).await {
            Ok(()) => HealthVerdict::Restarted,
            Err(e) => {
                error!("Health restart failed: {}", e);
                HealthVerdict::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_timeout_is_clamped() {
        let manager = SessionManager::new(SessionOptions::default());
        assert_eq!(manager.command_timeout(None), Duration::from_secs(60));
        assert_eq!(
            manager.command_timeout(Some(Duration::ZERO)),
            Duration::from_secs(60)
        );
        assert_eq!(
            manager.command_timeout(Some(Duration::from_secs(3600))),
            Duration::from_secs(600)
        );
    }

    #[tokio::test]
    async fn test_execute_requires_active_session() {
        let manager = SessionManager::new(SessionOptions::default());
        let err = manager
            .execute("true", None, &BTreeMap::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::SessionInactive));
    }

    #[tokio::test]
    async fn test_second_execution_fails_fast() {
        let manager = SessionManager::new(SessionOptions::default());
        let _guard = manager.begin_execution().unwrap();
        assert!(manager.is_command_executing());
        assert!(matches!(
            manager.begin_execution(),
            Err(DeployError::CommandInFlight)
        ));
        drop(_guard);
        assert!(!manager.is_command_executing());
    }
}
