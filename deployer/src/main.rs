//! Stackdeploy - Entry Point
//!
//! Installs the copilot service stack on the local host.

use std::collections::HashMap;
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use stackdeploy::deploy::fsm::DeploymentPhase;
use stackdeploy::deploy::orchestrator::{Collaborators, Orchestrator};
use stackdeploy::deploy::status::DeploymentStatus;
use stackdeploy::environment::checker::{EnvironmentChecker, SystemEnvironmentChecker};
use stackdeploy::errors::DeployError;
use stackdeploy::filesys::file::File;
use stackdeploy::logs::{init_logging, LogLevel, LogOptions};
use stackdeploy::models::deployment::{DeploymentForm, DeploymentParams, ModelForm};
use stackdeploy::privilege::session::SessionManager;
use stackdeploy::storage::layout::StorageLayout;
use stackdeploy::storage::settings::Settings;
use stackdeploy::utils::version_info;

const USAGE: &str = "\
Usage: stackdeploy [--check | --deploy | --cleanup | --version] [options]

Options:
  --base-dir=<dir>          state directory (settings, logs, installer checkout)
  --log-level=<level>       trace, debug, info, warn or error
  --form=<file.json>        deployment form with `main` and `embedding` models
  --main-url=<url>          answer model endpoint    (MAIN_MODEL_URL)
  --main-model=<name>       answer model name        (MAIN_MODEL_NAME)
  --main-key=<key>          answer model API key     (MAIN_MODEL_KEY)
  --embedding-url=<url>     embedding endpoint       (EMBEDDING_MODEL_URL)
  --embedding-model=<name>  embedding model name     (EMBEDDING_MODEL_NAME)
  --embedding-key=<key>     embedding API key        (EMBEDDING_MODEL_KEY)";

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Unable to render version: {e}"),
        }
        return ExitCode::SUCCESS;
    }

    let action = ["check", "deploy", "cleanup"]
        .into_iter()
        .find(|flag| cli_args.contains_key(*flag));
    let Some(action) = action else {
        println!("{}", USAGE);
        return ExitCode::FAILURE;
    };

    let layout = match cli_args.get("base-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };
    if let Err(e) = layout.setup().await {
        eprintln!("Unable to prepare {}: {e}", layout.base_dir.display());
        return ExitCode::FAILURE;
    }

    // Retrieve the settings file, writing the defaults on first run
    let settings_file = layout.settings_file();
    let settings = if settings_file.exists().await {
        match settings_file.read_json::<Settings>().await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Unable to read settings file: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        let settings = Settings::default();
        if let Err(e) = settings_file.write_json(&settings).await {
            eprintln!("Unable to write default settings: {e}");
        }
        settings
    };

    // Initialize logging
    let log_level = match cli_args.get("log-level") {
        Some(level) => match level.parse::<LogLevel>() {
            Ok(level) => level,
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::FAILURE;
            }
        },
        None => settings.log_level.clone(),
    };
    let log_options = LogOptions {
        log_level,
        log_dir: Some(layout.logs_dir().path().to_path_buf()),
        json_format: settings.log_json,
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };
    info!(
        "stackdeploy {} ({}, built {})",
        version.version, version.git_hash, version.build_time
    );

    let result = match action {
        "check" => run_check().await,
        "cleanup" => {
            let orchestrator = build_orchestrator(layout, &settings);
            orchestrator.cleanup().await
        }
        _ => match read_params(&cli_args).await {
            Ok(params) => {
                let orchestrator = Arc::new(build_orchestrator(layout, &settings));
                run_deploy(orchestrator, params).await
            }
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", e.user_message().red());
            ExitCode::FAILURE
        }
    }
}

fn build_orchestrator(layout: StorageLayout, settings: &Settings) -> Orchestrator {
    let session = Arc::new(SessionManager::new(settings.session_options()));
    Orchestrator::new(
        layout,
        settings.deploy_options(),
        session,
        Collaborators::system(settings),
    )
}

async fn run_check() -> Result<(), DeployError> {
    let report = SystemEnvironmentChecker::default().check_all().await;
    for err in &report.errors {
        println!("{} {}", "error".red().bold(), err);
    }
    for warning in &report.warnings {
        println!("{} {}", "warning".yellow().bold(), warning);
    }
    if !report.success {
        return Err(DeployError::EnvironmentError(report.errors));
    }
    println!("{}", "Environment check passed".green());
    Ok(())
}

async fn read_params(cli_args: &HashMap<String, String>) -> Result<DeploymentParams, DeployError> {
    let form = match cli_args.get("form") {
        Some(path) => File::new(path).read_json::<DeploymentForm>().await?,
        None => {
            // flag first, then the environment variable
            let value = |flag: &str, var: &str| {
                cli_args
                    .get(flag)
                    .cloned()
                    .or_else(|| env::var(var).ok())
                    .unwrap_or_default()
            };
            DeploymentForm {
                main: ModelForm {
                    url: value("main-url", "MAIN_MODEL_URL"),
                    model_name: value("main-model", "MAIN_MODEL_NAME"),
                    api_key: value("main-key", "MAIN_MODEL_KEY"),
                },
                embedding: ModelForm {
                    url: value("embedding-url", "EMBEDDING_MODEL_URL"),
                    model_name: value("embedding-model", "EMBEDDING_MODEL_NAME"),
                    api_key: value("embedding-key", "EMBEDDING_MODEL_KEY"),
                },
            }
        }
    };
    DeploymentParams::try_from(form)
}

async fn run_deploy(
    orchestrator: Arc<Orchestrator>,
    params: DeploymentParams,
) -> Result<(), DeployError> {
    let printer = tokio::spawn(print_status(orchestrator.subscribe()));

    let stopper = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            await_shutdown_signal().await;
            if orchestrator.stop_deployment() {
                warn!("Stopping deployment...");
            }
        })
    };

    let result = orchestrator.start_deployment(&params).await;

    stopper.abort();
    // let the printer drain the final snapshot
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();
    result
}

async fn print_status(mut rx: tokio::sync::broadcast::Receiver<DeploymentStatus>) {
    loop {
        match rx.recv().await {
            Ok(status) => println!("{}", render_status(&status)),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Status printer skipped {} update(s)", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn render_status(status: &DeploymentStatus) -> String {
    let label = format!("[{:>3}%] {:<11}", status.progress, status.status.as_str());
    let label = match status.status {
        DeploymentPhase::Success => label.green().bold(),
        DeploymentPhase::Error => label.red().bold(),
        DeploymentPhase::Idle => label.dimmed(),
        _ => label.cyan(),
    };
    let mut line = format!("{} {}", label, status.message);
    if let Some(seconds) = status.estimated_time {
        line.push_str(&format!(" (~{}m left)", seconds.div_ceil(60)));
    }
    line
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Unable to install signal handlers: {}", e);
                    std::future::pending::<()>().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, stopping...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, stopping...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl+C received, stopping...");
    }
}
