//! Orchestrator tests with fake collaborators and scripted installer steps

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use stackdeploy::config::values::ValuesTemplater;
use stackdeploy::deploy::cluster::{ClusterOptions, ClusterProbe};
use stackdeploy::deploy::fsm::DeploymentPhase;
use stackdeploy::deploy::git::{InstallerSource, SyncKind};
use stackdeploy::deploy::orchestrator::{Collaborators, DeployOptions, Orchestrator};
use stackdeploy::deploy::status::DeploymentStatus;
use stackdeploy::deploy::steps::{Domains, STEP_TABLE};
use stackdeploy::environment::checker::{EnvironmentChecker, EnvironmentReport};
use stackdeploy::errors::{DeployError, FailureCategory};
use stackdeploy::models::deployment::{DeploymentForm, DeploymentParams, ModelForm};
use stackdeploy::privilege::elevation::Launcher;
use stackdeploy::privilege::session::{SessionManager, SessionOptions};
use stackdeploy::storage::layout::StorageLayout;

struct FakeChecker {
    report: EnvironmentReport,
}

#[async_trait]
impl EnvironmentChecker for FakeChecker {
    async fn check_all(&self) -> EnvironmentReport {
        self.report.clone()
    }
}

#[derive(Default)]
struct FakeSource {
    syncs: AtomicU32,
}

#[async_trait]
impl InstallerSource for FakeSource {
    async fn sync(&self, _target: &Path, _cancel: &CancellationToken) -> Result<SyncKind, DeployError> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(SyncKind::Updated)
    }
}

struct ReadyCluster;

#[async_trait]
impl ClusterProbe for ReadyCluster {
    async fn ready_nodes(
        &self,
        _session: &SessionManager,
        _cancel: &CancellationToken,
    ) -> Result<usize, DeployError> {
        Ok(1)
    }
}

struct Fixture {
    _dir: TempDir,
    layout: StorageLayout,
    run_log: PathBuf,
    hosts_file: PathBuf,
    source: Arc<FakeSource>,
}

impl Fixture {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().join("state"));
        let run_log = dir.path().join("runs.log");
        let hosts_file = dir.path().join("hosts");
        tokio::fs::write(&hosts_file, "127.0.0.1 localhost\n")
            .await
            .unwrap();

        let values = layout.values_file();
        tokio::fs::create_dir_all(values.path().parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(values.path(), "globals:\n  arch: x86\n")
            .await
            .unwrap();

        let fixture = Self {
            _dir: dir,
            layout,
            run_log,
            hosts_file,
            source: Arc::new(FakeSource::default()),
        };
        fixture
            .write_step("6-install-databases", "echo databases >> \"$RUN_LOG\"")
            .await;
        fixture
            .write_step(
                "7-install-authhub",
                "read -r domain\necho \"authhub $domain\" >> \"$RUN_LOG\"",
            )
            .await;
        fixture
            .write_step(
                "8-install-EulerCopilot",
                "echo \"copilot $EULERCOPILOT_DOMAIN $NON_INTERACTIVE\" >> \"$RUN_LOG\"",
            )
            .await;
        fixture
    }

    async fn write_step(&self, id: &str, body: &str) {
        let step = STEP_TABLE.iter().find(|s| s.id == id).unwrap();
        let path = step.script(self.layout.scripts_dir().path());
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        let script = format!(
            "#!/bin/bash\nRUN_LOG='{}'\n{}\n",
            self.run_log.display(),
            body
        );
        tokio::fs::write(&path, script).await.unwrap();
    }

    async fn remove_step(&self, id: &str) {
        let step = STEP_TABLE.iter().find(|s| s.id == id).unwrap();
        tokio::fs::remove_file(step.script(self.layout.scripts_dir().path()))
            .await
            .unwrap();
    }

    fn orchestrator(&self, report: EnvironmentReport) -> Orchestrator {
        self.build(report, false)
    }

    /// Runs every privileged command through a real, unelevated worker
    fn privileged_orchestrator(&self, report: EnvironmentReport) -> Orchestrator {
        self.build(report, true)
    }

    fn build(&self, report: EnvironmentReport, require_privilege: bool) -> Orchestrator {
        let options = DeployOptions {
            domains: Domains::default(),
            hosts_file: self.hosts_file.clone(),
            step_timeout: Duration::from_secs(30),
            cluster: ClusterOptions {
                poll_interval: Duration::from_millis(10),
                poll_attempts: 2,
                ..Default::default()
            },
            require_privilege,
        };
        let session = Arc::new(SessionManager::new(SessionOptions {
            launcher: Launcher::direct(),
            superuser: false,
            enable_fallback: false,
            ..Default::default()
        }));
        Orchestrator::new(
            self.layout.clone(),
            options,
            session,
            Collaborators {
                checker: Arc::new(FakeChecker { report }),
                source: self.source.clone(),
                templater: Arc::new(ValuesTemplater::new()),
                probe: Arc::new(ReadyCluster),
            },
        )
    }

    async fn runs(&self) -> Vec<String> {
        match tokio::fs::read_to_string(&self.run_log).await {
            Ok(content) => content.lines().map(str::to_string).collect(),
            Err(_) => Vec::new(),
        }
    }
}

fn healthy_report() -> EnvironmentReport {
    EnvironmentReport {
        success: true,
        ..Default::default()
    }
}

fn params() -> DeploymentParams {
    DeploymentParams::try_from(DeploymentForm {
        main: ModelForm {
            url: "llm.example.com/v1".to_string(),
            model_name: "qwen".to_string(),
            api_key: "sk-main".to_string(),
        },
        embedding: ModelForm {
            url: "https://embed.example.com/v1".to_string(),
            model_name: "bge".to_string(),
            api_key: "sk-embed".to_string(),
        },
    })
    .unwrap()
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<DeploymentStatus>) -> Vec<DeploymentStatus> {
    let mut statuses = Vec::new();
    while let Ok(status) = rx.try_recv() {
        statuses.push(status);
    }
    statuses
}

#[tokio::test]
async fn test_successful_run_executes_steps_in_order() {
    let fixture = Fixture::new().await;
    let orchestrator = fixture.orchestrator(healthy_report());
    let mut rx = orchestrator.subscribe();

    orchestrator.start_deployment(&params()).await.unwrap();

    assert_eq!(
        fixture.runs().await,
        [
            "databases",
            "authhub authhub.eulercopilot.local",
            "copilot www.eulercopilot.local 1",
        ]
    );

    let statuses = drain(&mut rx);
    assert_eq!(statuses.first(), Some(&DeploymentStatus::idle()));
    let last = statuses.last().unwrap();
    assert_eq!(last.status, DeploymentPhase::Success);
    assert_eq!(last.progress, 100);
    assert_eq!(last.message, "Deployment complete");

    // progress never goes backwards within a run
    let progress: Vec<u8> = statuses.iter().map(|s| s.progress).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");

    let step_ids: Vec<&str> = statuses
        .iter()
        .filter_map(|s| s.current_step.as_deref())
        .collect();
    assert_eq!(
        step_ids,
        ["6-install-databases", "7-install-authhub", "8-install-EulerCopilot"]
    );

    let hosts = tokio::fs::read_to_string(&fixture.hosts_file).await.unwrap();
    assert!(hosts.contains("www.eulercopilot.local"));
    assert!(hosts.contains("authhub.eulercopilot.local"));

    let values = tokio::fs::read_to_string(fixture.layout.values_file().path())
        .await
        .unwrap();
    assert!(values.contains("https://llm.example.com/v1"));
    assert!(values.contains("arch: x86"));

    assert_eq!(orchestrator.phase(), DeploymentPhase::Idle);
    assert!(!orchestrator.session().is_active());
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn test_failing_step_halts_the_run() {
    let fixture = Fixture::new().await;
    fixture
        .write_step("7-install-authhub", "echo 'chart rejected' >&2\nexit 3")
        .await;
    let orchestrator = fixture.orchestrator(healthy_report());

    let err = orchestrator.start_deployment(&params()).await.unwrap_err();
    assert_eq!(err.phase(), Some(DeploymentPhase::Deploying));
    assert!(matches!(err.root(), DeployError::ScriptError { code: 3, .. }));

    assert_eq!(fixture.runs().await, ["databases"]);

    let status = orchestrator.status();
    assert_eq!(status.status, DeploymentPhase::Error);
    assert_eq!(status.current_step.as_deref(), Some("7-install-authhub"));
    assert!(status.message.contains("chart rejected"), "{}", status.message);

    // hosts entries belong to a completed run only
    let hosts = tokio::fs::read_to_string(&fixture.hosts_file).await.unwrap();
    assert!(!hosts.contains("eulercopilot"));
}

#[tokio::test]
async fn test_missing_script_is_reported() {
    let fixture = Fixture::new().await;
    fixture.remove_step("8-install-EulerCopilot").await;
    let orchestrator = fixture.orchestrator(healthy_report());

    let err = orchestrator.start_deployment(&params()).await.unwrap_err();
    assert!(matches!(err.root(), DeployError::NotFound(_)));
    assert_eq!(err.category(), FailureCategory::MissingFile);
    assert_eq!(
        orchestrator.status().current_step.as_deref(),
        Some("8-install-EulerCopilot")
    );
    assert_eq!(fixture.runs().await.len(), 2);
}

#[tokio::test]
async fn test_environment_failure_stops_before_clone() {
    let fixture = Fixture::new().await;
    let orchestrator = fixture.orchestrator(EnvironmentReport {
        success: false,
        errors: vec!["Memory: 1024MB available, 4096MB required".to_string()],
        ..Default::default()
    });

    let err = orchestrator.start_deployment(&params()).await.unwrap_err();
    assert_eq!(err.phase(), Some(DeploymentPhase::Preparing));
    assert!(matches!(err.root(), DeployError::EnvironmentError(_)));
    assert_eq!(fixture.source.syncs.load(Ordering::SeqCst), 0);
    assert!(fixture.runs().await.is_empty());

    let status = orchestrator.status();
    assert_eq!(status.status, DeploymentPhase::Error);
    assert!(status.message.contains("4096MB required"));
}

#[tokio::test]
async fn test_stop_returns_to_idle() {
    let fixture = Fixture::new().await;
    fixture
        .write_step("6-install-databases", "sleep 5\necho databases >> \"$RUN_LOG\"")
        .await;
    let orchestrator = Arc::new(fixture.orchestrator(healthy_report()));
    let mut rx = orchestrator.subscribe();

    let runner = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.start_deployment(&params()).await })
    };

    // wait until the first step is underway
    let mut waited = Duration::ZERO;
    while orchestrator.status().current_step.as_deref() != Some("6-install-databases") {
        assert!(waited < Duration::from_secs(10), "first step never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }

    let second = orchestrator.start_deployment(&params()).await.unwrap_err();
    assert!(matches!(second, DeployError::ValidationError(_)));

    assert!(orchestrator.stop_deployment());
    let err = runner.await.unwrap().unwrap_err();
    assert!(err.is_aborted());

    let status = orchestrator.status();
    assert_eq!(status.status, DeploymentPhase::Idle);
    assert_eq!(status.message, "Deployment stopped");
    assert_eq!(orchestrator.phase(), DeploymentPhase::Idle);
    assert!(!orchestrator.stop_deployment());
    assert!(fixture.runs().await.is_empty());

    // a stopped run is never reported as failed
    let statuses = drain(&mut rx);
    assert!(!statuses.is_empty());
    assert!(
        statuses.iter().all(|s| s.status != DeploymentPhase::Error),
        "{statuses:?}"
    );
}

#[tokio::test]
async fn test_rerun_starts_from_idle() {
    let fixture = Fixture::new().await;
    fixture.write_step("6-install-databases", "exit 1").await;
    let orchestrator = fixture.orchestrator(healthy_report());

    assert!(orchestrator.start_deployment(&params()).await.is_err());
    assert_eq!(orchestrator.status().status, DeploymentPhase::Error);

    fixture
        .write_step("6-install-databases", "echo databases >> \"$RUN_LOG\"")
        .await;
    let mut rx = orchestrator.subscribe();
    orchestrator.start_deployment(&params()).await.unwrap();

    let statuses = drain(&mut rx);
    assert_eq!(statuses.first(), Some(&DeploymentStatus::idle()));
    assert_eq!(statuses.last().unwrap().status, DeploymentPhase::Success);
    assert_eq!(fixture.source.syncs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cleanup_removes_checkout() {
    let fixture = Fixture::new().await;
    let orchestrator = fixture.orchestrator(healthy_report());
    assert!(fixture.layout.deployment_dir().exists().await);

    orchestrator.cleanup().await.unwrap();

    assert!(!fixture.layout.deployment_dir().exists().await);
    let status = orchestrator.status();
    assert_eq!(status.status, DeploymentPhase::Idle);
    assert_eq!(status.message, "Cleanup complete");
}

#[tokio::test]
async fn test_privileged_run_goes_through_worker() {
    let fixture = Fixture::new().await;
    let orchestrator = Arc::new(fixture.privileged_orchestrator(healthy_report()));

    let watcher = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            loop {
                if let Some(pid) = orchestrator.session().pid() {
                    return pid;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    orchestrator.start_deployment(&params()).await.unwrap();
    let worker_pid = tokio::time::timeout(Duration::from_secs(1), watcher)
        .await
        .unwrap()
        .unwrap();
    assert!(worker_pid > 0);

    // the AuthHub answer and the exported env reach the scripts
    assert_eq!(
        fixture.runs().await,
        [
            "databases",
            "authhub authhub.eulercopilot.local",
            "copilot www.eulercopilot.local 1",
        ]
    );
    let hosts = tokio::fs::read_to_string(&fixture.hosts_file).await.unwrap();
    assert!(hosts.contains("authhub.eulercopilot.local"));

    assert_eq!(orchestrator.status().status, DeploymentPhase::Success);
    assert!(!orchestrator.session().is_active());
    assert_eq!(orchestrator.session().pid(), None);
}

#[tokio::test]
async fn test_privileged_failure_tears_session_down() {
    let fixture = Fixture::new().await;
    fixture
        .write_step("8-install-EulerCopilot", "echo 'pods pending' >&2\nexit 4")
        .await;
    let orchestrator = fixture.privileged_orchestrator(healthy_report());

    let err = orchestrator.start_deployment(&params()).await.unwrap_err();
    assert!(matches!(err.root(), DeployError::ScriptError { code: 4, .. }));
    assert_eq!(fixture.runs().await.len(), 2);

    let status = orchestrator.status();
    assert_eq!(status.status, DeploymentPhase::Error);
    assert!(status.message.contains("pods pending"), "{}", status.message);
    assert!(!orchestrator.session().is_active());
    assert_eq!(orchestrator.session().pid(), None);
}
