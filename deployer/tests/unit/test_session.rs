//! Privileged session tests, run against an unelevated bash worker

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use stackdeploy::errors::{DeployError, TimeoutOrigin};
use stackdeploy::privilege::elevation::Launcher;
use stackdeploy::privilege::session::{HealthVerdict, SessionManager, SessionOptions};
use stackdeploy::privilege::shutdown::ShutdownOptions;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

fn test_options() -> SessionOptions {
    SessionOptions {
        startup_timeout: Duration::from_secs(10),
        health_check_interval: Duration::from_secs(3600),
        health_check_timeout: Duration::from_millis(500),
        restart_attempts: 3,
        restart_backoff: Duration::from_millis(10),
        restart_settle: Duration::from_millis(10),
        default_command_timeout: Duration::from_secs(10),
        max_command_timeout: Duration::from_secs(30),
        launcher: Launcher::direct(),
        fallback_launcher: Launcher::direct(),
        superuser: false,
        enable_fallback: false,
        shutdown: ShutdownOptions {
            exit_grace: Duration::from_millis(500),
            terminate_grace: Duration::from_millis(500),
            kill_grace: Duration::from_millis(500),
        },
        ..Default::default()
    }
}

async fn started(options: SessionOptions) -> Arc<SessionManager> {
    let manager = Arc::new(SessionManager::new(options));
    manager.start(&CancellationToken::new()).await.unwrap();
    manager
}

fn no_env() -> BTreeMap<String, String> {
    BTreeMap::new()
}

// Worker that announces itself but never answers health probes
const SILENT_WORKER: &str = r#"printf 'WORKER_READY_%s\n' "$$"
while IFS= read -r line; do
    [ "$line" = EXIT ] && exit 0
done
"#;

// Worker that answers probes and runs each command inline
const INLINE_WORKER: &str = r#"printf 'WORKER_READY_%s\n' "$$"
while IFS= read -r line; do
    case "$line" in
        EXIT) exit 0 ;;
        HEALTH_CHECK_*) printf '%s_DONE\n' "$line" ;;
        *) output=$(eval "$line"); printf '%s\nCOMMAND_SUCCESS_%s\n' "$output" "$$" ;;
    esac
done
"#;

// Worker that answers probes but dies as soon as it receives a command
const CRASHING_WORKER: &str = r#"printf 'WORKER_READY_%s\n' "$$"
while IFS= read -r line; do
    case "$line" in
        HEALTH_CHECK_*) printf '%s_DONE\n' "$line" ;;
        *) exit 1 ;;
    esac
done
"#;

// Worker that never signals ready
const HANGING_WORKER: &str = "exec sleep 30";

// Worker that fails to start
const FAILING_WORKER: &str = "exit 3";

// First launch runs `first`, every later launch runs `later`
fn scripted_worker(counter: &Path, first: &str, later: &str) -> String {
    format!(
        r#"counter='{}'
runs=0
[ -f "$counter" ] && runs=$(wc -l < "$counter")
echo run >> "$counter"
if [ "$runs" -eq 0 ]; then
{}
else
{}
fi
"#,
        counter.display(),
        first,
        later
    )
}

async fn launches(counter: &Path) -> usize {
    tokio::fs::read_to_string(counter)
        .await
        .map(|content| content.lines().count())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_start_reports_worker_pid() {
    let manager = started(test_options()).await;
    assert!(manager.is_active());
    assert!(manager.pid().is_some());
    assert!(manager.started_at().is_some());
    manager.stop().await;
}

#[tokio::test]
async fn test_execute_returns_stdout() {
    let manager = started(test_options()).await;
    let cancel = CancellationToken::new();

    let output = assert_ok!(
        manager
            .execute("echo first; echo second", None, &no_env(), &cancel)
            .await
    );
    assert_eq!(output.trim(), "first\nsecond");

    // the worker stays usable for the next command
    let output = manager
        .execute("echo again", None, &no_env(), &cancel)
        .await
        .unwrap();
    assert_eq!(output.trim(), "again");
    manager.stop().await;
}

#[tokio::test]
async fn test_execute_exports_environment() {
    let manager = started(test_options()).await;
    let mut env = BTreeMap::new();
    env.insert("GREETING".to_string(), "hello world".to_string());

    let output = manager
        .execute("echo \"$GREETING\"", None, &env, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(output.trim(), "hello world");
    manager.stop().await;
}

#[tokio::test]
async fn test_failure_carries_code_and_stderr() {
    let manager = started(test_options()).await;

    let err = manager
        .execute(
            "echo broken >&2; exit 3",
            None,
            &no_env(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    match err {
        DeployError::ScriptError { code, stderr } => {
            assert_eq!(code, 3);
            assert!(stderr.contains("broken"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    manager.stop().await;
}

#[tokio::test]
async fn test_exit_124_is_a_worker_timeout() {
    let manager = started(test_options()).await;

    let err = assert_err!(
        manager
            .execute("exit 124", None, &no_env(), &CancellationToken::new())
            .await
    );
    assert!(matches!(
        err,
        DeployError::CommandTimeoutError {
            origin: TimeoutOrigin::Worker,
            ..
        }
    ));
    manager.stop().await;
}

#[tokio::test]
async fn test_deadline_timeout_keeps_worker_usable() {
    let manager = started(test_options()).await;
    let cancel = CancellationToken::new();

    let err = manager
        .execute("sleep 5", Some(Duration::from_secs(1)), &no_env(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DeployError::CommandTimeoutError {
            origin: TimeoutOrigin::Deadline,
            ..
        }
    ));

    let output = manager
        .execute("echo recovered", None, &no_env(), &cancel)
        .await
        .unwrap();
    assert_eq!(output.trim(), "recovered");
    manager.stop().await;
}

#[tokio::test]
async fn test_cancel_aborts_command() {
    let manager = started(test_options()).await;
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let err = manager
        .execute("sleep 5", None, &no_env(), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_aborted());
    assert!(!manager.is_command_executing());
    manager.stop().await;
}

#[tokio::test]
async fn test_superuser_runs_directly() {
    let manager = started(SessionOptions {
        superuser: true,
        ..test_options()
    })
    .await;
    assert!(manager.is_active());
    assert_eq!(manager.pid(), None);

    let output = manager
        .execute("echo direct", None, &no_env(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(output.trim(), "direct");
    assert_eq!(
        manager.run_health_cycle(&CancellationToken::new()).await,
        HealthVerdict::Skipped
    );
    manager.stop().await;
}

#[tokio::test]
async fn test_unresponsive_worker_is_restarted() {
    let manager = started(SessionOptions {
        worker_script: Some(SILENT_WORKER.to_string()),
        ..test_options()
    })
    .await;
    let first_pid = manager.pid();

    let verdict = manager.run_health_cycle(&CancellationToken::new()).await;
    assert_eq!(verdict, HealthVerdict::Restarted);
    assert_eq!(manager.restart_count(), 1);
    assert!(manager.is_active());
    assert_ne!(manager.pid(), first_pid);
    manager.stop().await;
}

#[tokio::test]
async fn test_restart_gives_up_after_three_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("launches");
    let manager = started(SessionOptions {
        worker_script: Some(scripted_worker(&counter, SILENT_WORKER, FAILING_WORKER)),
        ..test_options()
    })
    .await;

    let err = manager
        .restart(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::ProcessLifecycleError(_)));
    assert!(!manager.is_active());

    // the initial launch plus three restart attempts
    assert_eq!(launches(&counter).await, 4);

    let err = manager
        .execute("true", None, &no_env(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::SessionInactive));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let manager = started(test_options()).await;
    manager.stop().await;
    assert!(!manager.is_active());
    assert_eq!(manager.pid(), None);
    manager.stop().await;
    assert!(!manager.is_active());
}

#[tokio::test]
async fn test_output_without_newline_keeps_markers_out() {
    let manager = started(test_options()).await;
    let cancel = CancellationToken::new();

    let err = manager
        .execute("printf partial; echo boom >&2; exit 2", None, &no_env(), &cancel)
        .await
        .unwrap_err();
    match err {
        DeployError::ScriptError { code, stderr } => {
            assert_eq!(code, 2);
            assert_eq!(stderr, "boom");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let output = assert_ok!(
        manager
            .execute("printf partial", None, &no_env(), &cancel)
            .await
    );
    assert_eq!(output, "partial");
    manager.stop().await;
}

#[tokio::test]
async fn test_cancel_during_health_restart() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("launches");
    let manager = started(SessionOptions {
        worker_script: Some(scripted_worker(&counter, SILENT_WORKER, HANGING_WORKER)),
        startup_timeout: Duration::from_secs(2),
        ..test_options()
    })
    .await;

    // the health cycle holds the worker through its probe and restart
    let monitor_cancel = CancellationToken::new();
    let health = {
        let manager = manager.clone();
        let cancel = monitor_cancel.clone();
        tokio::spawn(async move { manager.run_health_cycle(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let begun = Instant::now();
    let err = assert_err!(manager.execute("echo hi", None, &no_env(), &cancel).await);
    let elapsed = begun.elapsed();
    assert!(err.is_aborted(), "unexpected error: {err:?}");
    assert!(elapsed < Duration::from_secs(1), "cancel took {elapsed:?}");

    monitor_cancel.cancel();
    assert_eq!(health.await.unwrap(), HealthVerdict::Failed);
    manager.stop().await;
}

#[tokio::test]
async fn test_failed_restart_runs_command_once_directly() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("launches");
    let manager = started(SessionOptions {
        worker_script: Some(scripted_worker(&counter, SILENT_WORKER, FAILING_WORKER)),
        enable_fallback: true,
        ..test_options()
    })
    .await;

    let output = manager
        .execute("echo via-fallback", None, &no_env(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(output.trim(), "via-fallback");
    assert!(!manager.is_active());
    assert_eq!(launches(&counter).await, 4);

    // the fallback covers the interrupted command only
    let err = manager
        .execute("echo again", None, &no_env(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::SessionInactive));
}

#[tokio::test]
async fn test_command_is_redelivered_after_worker_loss() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("launches");
    let manager = started(SessionOptions {
        worker_script: Some(scripted_worker(&counter, CRASHING_WORKER, INLINE_WORKER)),
        ..test_options()
    })
    .await;
    let first_pid = manager.pid();

    let output = manager
        .execute("echo redelivered", None, &no_env(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(output.trim(), "redelivered");
    assert_eq!(manager.restart_count(), 1);
    assert_ne!(manager.pid(), first_pid);
    assert_eq!(launches(&counter).await, 2);
    manager.stop().await;
}

#[tokio::test]
async fn test_health_cycle_leaves_busy_worker_alone() {
    let manager = started(SessionOptions {
        slow_command_warning: Duration::from_millis(400),
        ..test_options()
    })
    .await;

    let running = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .execute("sleep 1; echo done", None, &BTreeMap::new(), &CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(manager.is_command_executing());

    let verdict = manager.run_health_cycle(&CancellationToken::new()).await;
    assert_eq!(verdict, HealthVerdict::Skipped);

    tokio::time::sleep(Duration::from_millis(400)).await;
    match manager.run_health_cycle(&CancellationToken::new()).await {
        HealthVerdict::SlowCommand(elapsed) => assert!(elapsed >= Duration::from_millis(400)),
        other => panic!("unexpected verdict: {other:?}"),
    }

    let output = running.await.unwrap().unwrap();
    assert_eq!(output.trim(), "done");
    assert_eq!(manager.restart_count(), 0);
    manager.stop().await;
}

#[tokio::test]
async fn test_monitor_restarts_unresponsive_worker() {
    let manager = started(SessionOptions {
        worker_script: Some(SILENT_WORKER.to_string()),
        health_check_interval: Duration::from_millis(100),
        ..test_options()
    })
    .await;

    let deadline = Instant::now() + Duration::from_secs(10);
    while manager.restart_count() == 0 {
        assert!(Instant::now() < deadline, "monitor never restarted the worker");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    manager.stop().await;
    assert!(!manager.is_active());
}
