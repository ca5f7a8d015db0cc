//! Deployment orchestrator: drives one run through every phase

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::values::{ConfigTemplater, ValuesTemplater};
use crate::deploy::cancel::CancellationGovernor;
use crate::deploy::cluster::{wait_until_ready, ClusterOptions, ClusterProbe, KubectlProbe};
use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentPhase};
use crate::deploy::git::{GitSource, InstallerSource, SyncKind};
use crate::deploy::hosts::ensure_entries;
use crate::deploy::status::{DeploymentStatus, StatusPublisher};
use crate::deploy::steps::{remaining_estimate, Domains, Step, STEP_TABLE, TOOLS_STEP};
use crate::environment::checker::{EnvironmentChecker, EnvironmentReport, SystemEnvironmentChecker};
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::models::deployment::DeploymentParams;
use crate::privilege::session::SessionManager;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Deployment options
#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub domains: Domains,
    pub hosts_file: PathBuf,
    /// Deadline of each installer step
    pub step_timeout: Duration,
    pub cluster: ClusterOptions,
    /// Establish an elevated session. Without it commands run directly.
    pub require_privilege: bool,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            domains: Domains::default(),
            hosts_file: PathBuf::from("/etc/hosts"),
            step_timeout: Duration::from_secs(600),
            cluster: ClusterOptions::default(),
            require_privilege: cfg!(target_os = "linux"),
        }
    }
}

/// Everything the orchestrator talks to besides the session
pub struct Collaborators {
    pub checker: Arc<dyn EnvironmentChecker>,
    pub source: Arc<dyn InstallerSource>,
    pub templater: Arc<dyn ConfigTemplater>,
    pub probe: Arc<dyn ClusterProbe>,
}

impl Collaborators {
    /// The production set: sysinfo checks, git, values.yaml and kubectl
    pub fn system(settings: &Settings) -> Self {
        Self {
            checker: Arc::new(SystemEnvironmentChecker::default()),
            source: Arc::new(GitSource::new(
                settings.repository.url.clone(),
                settings.repository.branch.clone(),
            )),
            templater: Arc::new(ValuesTemplater::new()),
            probe: Arc::new(KubectlProbe::new(&settings.cluster_options())),
        }
    }
}

// progress milestones
const CHECK_START: u8 = 10;
const CHECK_DONE: u8 = 20;
const CLONE_START: u8 = 30;
const CLONE_DONE: u8 = 40;
const PRIVILEGE: u8 = 45;
const CONFIGURE_START: u8 = 50;
const CONFIGURE_DONE: u8 = 60;
const TOOLS: u8 = 62;
const CLUSTER: u8 = 65;
const STEPS_START: u8 = 70;
const STEP_STRIDE: u8 = 7;
const HOSTS: u8 = 95;
const DONE: u8 = 100;

/// Owns the state of the single deployment a process runs at a time
pub struct Orchestrator {
    layout: StorageLayout,
    options: DeployOptions,
    session: Arc<SessionManager>,
    collaborators: Collaborators,
    fsm: Mutex<DeploymentFsm>,
    publisher: StatusPublisher,
    governor: CancellationGovernor,
}

impl Orchestrator {
    pub fn new(
        layout: StorageLayout,
        options: DeployOptions,
        session: Arc<SessionManager>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            layout,
            options,
            session,
            collaborators,
            fsm: Mutex::new(DeploymentFsm::new()),
            publisher: StatusPublisher::new(),
            governor: CancellationGovernor::new(),
        }
    }

    /// Latest published snapshot
    pub fn status(&self) -> DeploymentStatus {
        self.publisher.current()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentStatus> {
        self.publisher.subscribe()
    }

    pub fn phase(&self) -> DeploymentPhase {
        self.fsm().phase()
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn is_running(&self) -> bool {
        self.governor.is_running()
    }

    fn fsm(&self) -> std::sync::MutexGuard<'_, DeploymentFsm> {
        self.fsm.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, event: DeploymentEvent) -> Result<DeploymentPhase, DeployError> {
        let phase = self.fsm().process(event)?;
        debug!("Deployment phase: {}", phase);
        Ok(phase)
    }

    fn publish(&self, status: DeploymentStatus) {
        match &status.current_step {
            Some(step) => info!(
                "[{}] {} ({}%, step {})",
                status.status, status.message, status.progress, step
            ),
            None => info!("[{}] {} ({}%)", status.status, status.message, status.progress),
        }
        self.publisher.publish(status);
    }

    /// Run a full deployment. Only one run may be active at a time.
    pub async fn start_deployment(&self, params: &DeploymentParams) -> Result<(), DeployError> {
        let cancel = self.governor.begin().ok_or_else(|| {
            DeployError::ValidationError("a deployment is already running".to_string())
        })?;

        self.fsm_reset();
        self.publish(DeploymentStatus::idle());

        let result = self.run(params, &cancel).await;

        self.session.stop().await;
        self.governor.finish();

        match result {
            Ok(()) => {
                self.fsm_reset();
                Ok(())
            }
            Err(e) if e.is_aborted() || cancel.is_cancelled() => {
                if let Err(e) = self.transition(DeploymentEvent::Cancel) {
                    debug!("Cancel transition skipped: {}", e);
                }
                self.publish(DeploymentStatus::new(
                    DeploymentPhase::Idle,
                    "Deployment stopped",
                    0,
                ));
                Err(DeployError::Aborted)
            }
            Err(e) => {
                error!("Deployment failed: {}", e);
                self.fsm_reset();
                Err(e)
            }
        }
    }

    // The last snapshot is kept for the operator; only the phase returns to idle.
    fn fsm_reset(&self) {
        let mut fsm = self.fsm();
        if fsm.phase().is_running() {
            if let Err(e) = fsm.process(DeploymentEvent::Cancel) {
                warn!("Could not abandon previous run: {}", e);
            }
        }
        if let Err(e) = fsm.process(DeploymentEvent::Reset) {
            warn!("Could not reset deployment state: {}", e);
        }
    }

    async fn run(
        &self,
        params: &DeploymentParams,
        cancel: &CancellationToken,
    ) -> Result<(), DeployError> {
        self.transition(DeploymentEvent::Start)?;

        let report = self
            .in_phase(DeploymentPhase::Preparing, cancel, self.check_environment(cancel))
            .await?;
        self.transition(DeploymentEvent::Checked)?;

        self.in_phase(DeploymentPhase::Cloning, cancel, self.sync_installer(cancel))
            .await?;
        self.transition(DeploymentEvent::Cloned)?;

        self.in_phase(
            DeploymentPhase::Configuring,
            cancel,
            self.configure(params, cancel),
        )
        .await?;
        self.transition(DeploymentEvent::Configured)?;

        self.in_phase(
            DeploymentPhase::Preparing,
            cancel,
            self.verify_cluster(&report, cancel),
        )
        .await?;
        self.transition(DeploymentEvent::ClusterReady)?;

        self.in_phase(DeploymentPhase::Deploying, cancel, self.run_steps(cancel))
            .await?;
        self.transition(DeploymentEvent::Completed)?;

        self.publish(DeploymentStatus::new(
            DeploymentPhase::Success,
            "Deployment complete",
            DONE,
        ));
        Ok(())
    }

    /// Attach phase context to a failure and publish it, unless the run was cancelled
    async fn in_phase<T>(
        &self,
        phase: DeploymentPhase,
        cancel: &CancellationToken,
        work: impl Future<Output = Result<T, DeployError>>,
    ) -> Result<T, DeployError> {
        if cancel.is_cancelled() {
            return Err(DeployError::Aborted.in_phase(phase));
        }

        let err = match work.await {
            Ok(value) => return Ok(value),
            // a killed child can surface as an ordinary failure
            Err(_) if cancel.is_cancelled() => DeployError::Aborted,
            Err(e) => e,
        };
        let err = err.in_phase(phase);

        if !err.is_aborted() {
            let message = err.user_message();
            if let Err(e) = self.transition(DeploymentEvent::Fail(message.clone())) {
                warn!("{}", e);
            }
            let current = self.publisher.current();
            let mut status = DeploymentStatus::new(DeploymentPhase::Error, message, current.progress);
            status.current_step = current.current_step;
            self.publish(status);
        }
        Err(err)
    }

    async fn check_environment(
        &self,
        cancel: &CancellationToken,
    ) -> Result<EnvironmentReport, DeployError> {
        self.publish(DeploymentStatus::new(
            DeploymentPhase::Preparing,
            "Checking system environment",
            CHECK_START,
        ));

        let report = tokio::select! {
            report = self.collaborators.checker.check_all() => report,
            _ = cancel.cancelled() => return Err(DeployError::Aborted),
        };
        if !report.success {
            return Err(DeployError::EnvironmentError(report.errors));
        }

        self.publish(DeploymentStatus::new(
            DeploymentPhase::Preparing,
            "Environment check passed",
            CHECK_DONE,
        ));
        Ok(report)
    }

    async fn sync_installer(&self, cancel: &CancellationToken) -> Result<(), DeployError> {
        self.publish(DeploymentStatus::new(
            DeploymentPhase::Cloning,
            "Fetching installer repository",
            CLONE_START,
        ));

        let target = self.layout.deployment_dir();
        let kind = self
            .collaborators
            .source
            .sync(target.path(), cancel)
            .await?;

        let message = match kind {
            SyncKind::Cloned => "Installer repository cloned",
            SyncKind::Updated => "Installer repository updated",
        };
        self.publish(DeploymentStatus::new(
            DeploymentPhase::Cloning,
            message,
            CLONE_DONE,
        ));
        Ok(())
    }

    async fn configure(
        &self,
        params: &DeploymentParams,
        cancel: &CancellationToken,
    ) -> Result<(), DeployError> {
        if self.options.require_privilege {
            self.publish(DeploymentStatus::new(
                DeploymentPhase::Configuring,
                "Requesting administrator permission",
                PRIVILEGE,
            ));
            self.session.start(cancel).await?;
        } else {
            self.session.start_direct().await;
        }

        self.publish(DeploymentStatus::new(
            DeploymentPhase::Configuring,
            "Writing model configuration",
            CONFIGURE_START,
        ));
        let values = self.layout.values_file();
        if !values.exists().await {
            return Err(DeployError::NotFound(format!(
                "values file {}",
                values.path().display()
            )));
        }
        self.collaborators
            .templater
            .apply(values.path(), params)
            .await?;

        self.publish(DeploymentStatus::new(
            DeploymentPhase::Configuring,
            "Model configuration written",
            CONFIGURE_DONE,
        ));
        Ok(())
    }

    async fn verify_cluster(
        &self,
        report: &EnvironmentReport,
        cancel: &CancellationToken,
    ) -> Result<(), DeployError> {
        if report.needs_cluster_tools() {
            self.publish(
                DeploymentStatus::new(
                    DeploymentPhase::Preparing,
                    format!(
                        "Installing cluster tools ({})",
                        report.missing_cluster_tools.join(", ")
                    ),
                    TOOLS,
                )
                .with_step(TOOLS_STEP.id)
                .with_estimate(TOOLS_STEP.estimate.as_secs()),
            );
            self.run_step(&TOOLS_STEP, cancel).await?;
        }

        self.publish(DeploymentStatus::new(
            DeploymentPhase::Preparing,
            "Waiting for the cluster to become ready",
            CLUSTER,
        ));
        let nodes = wait_until_ready(
            self.collaborators.probe.as_ref(),
            &self.session,
            &self.options.cluster,
            cancel,
        )
        .await?;
        debug!("{} ready node(s)", nodes);
        Ok(())
    }

    async fn run_steps(&self, cancel: &CancellationToken) -> Result<(), DeployError> {
        for (index, step) in STEP_TABLE.iter().enumerate() {
            let progress = STEPS_START.saturating_add(STEP_STRIDE.saturating_mul(index as u8));
            self.publish(
                DeploymentStatus::new(
                    DeploymentPhase::Deploying,
                    format!("{}...", step.display_name),
                    progress,
                )
                .with_step(step.id)
                .with_estimate(remaining_estimate(index).as_secs()),
            );
            self.run_step(step, cancel).await?;
        }

        self.publish(DeploymentStatus::new(
            DeploymentPhase::Deploying,
            "Adding local domain entries",
            HOSTS,
        ));
        let domains = self.options.domains.all();
        ensure_entries(&self.session, &self.options.hosts_file, &domains, cancel).await?;
        Ok(())
    }

    async fn run_step(&self, step: &Step, cancel: &CancellationToken) -> Result<(), DeployError> {
        let scripts_dir = self.layout.scripts_dir();
        let scripts_dir: &Path = scripts_dir.path();
        let script = File::new(step.script(scripts_dir));
        if !script.exists().await {
            return Err(DeployError::NotFound(format!(
                "installer script {}",
                script.path().display()
            )));
        }

        let timeout = self
            .options
            .step_timeout
            .min(self.session.options().max_command_timeout);
        let command = step.command(scripts_dir, &self.options.domains, timeout);
        let output = self
            .session
            .execute(
                &command,
                Some(timeout),
                &step.env(&self.options.domains),
                cancel,
            )
            .await
            .map_err(|e| e.with_step(step.display_name))?;

        info!("Step {} finished", step.id);
        if let Some(last) = output.lines().last() {
            debug!("{}: {}", step.id, last);
        }
        Ok(())
    }

    /// Cancel the running deployment. Returns false when nothing is running.
    pub fn stop_deployment(&self) -> bool {
        self.governor.cancel()
    }

    /// Remove the cloned installer and close the session. Refused while a run is active.
    pub async fn cleanup(&self) -> Result<(), DeployError> {
        if self.governor.is_running() {
            return Err(DeployError::ValidationError(
                "cannot clean up while a deployment is running".to_string(),
            ));
        }

        self.session.stop().await;
        let dir = self.layout.deployment_dir();
        if dir.exists().await {
            dir.delete().await?;
            info!("Removed {}", dir.path().display());
        }

        self.publish(DeploymentStatus::new(
            DeploymentPhase::Idle,
            "Cleanup complete",
            0,
        ));
        Ok(())
    }
}
