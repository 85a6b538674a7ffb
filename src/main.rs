//! Kanban Autopilot CLI
//!
//! Polls the configured board and drives the analysis and development pipelines.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use kanban_autopilot::pipeline::{AnalysisPipeline, DevelopmentPipeline, PipelineDeps};
use kanban_autopilot::process::{ExecIdentity, ProcessRunner, SandboxedRunner};
use kanban_autopilot::secrets::{SecretsManager, BOARD_API_KEY, BOARD_TOKEN, GITHUB_TOKEN};
use kanban_autopilot::{
    shutdown_signal, status, BoardApi, Config, Driver, Error, Result, TrelloClient, Validate,
    DEFAULT_CONFIG_FILE,
};

#[derive(Parser)]
#[command(name = "kanban-autopilot")]
#[command(version, about = "Board-driven analysis and development pipelines for coding agents")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, env = "AUTOPILOT_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the board until interrupted (default)
    Run,
    /// Show card counts, ledger state and recent log lines
    Status,
    /// Validate the configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("failed to read .env: {}", e);
        }
    }

    let cli = Cli::parse();
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let _guard = init_tracing(Some(&config));
            run(config).await
        }
        Commands::Status => {
            init_tracing(None);
            print_status(&config).await
        }
        Commands::CheckConfig => check_config(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "exiting");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Logs to stderr and, when `config` is given, to `<logs_dir>/<bot>.log`.
///
/// The returned guard flushes the file writer when dropped.
fn init_tracing(config: Option<&Config>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let Some(config) = config else {
        tracing_subscriber::registry().with(filter).with(stderr).init();
        return None;
    };

    if let Err(e) = std::fs::create_dir_all(&config.logs_dir) {
        eprintln!("cannot create logs dir {}: {}", config.logs_dir.display(), e);
    }
    let appender = tracing_appender::rolling::never(&config.logs_dir, config.log_file_name());
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
    Some(guard)
}

fn board_client(config: &Config, secrets: &SecretsManager) -> Result<TrelloClient> {
    let key = secrets.get(BOARD_API_KEY).unwrap_or_default();
    let token = secrets.get(BOARD_TOKEN).unwrap_or_default();
    TrelloClient::new(&config.board.api_base_url, key, token)
}

fn load_secrets() -> Result<SecretsManager> {
    SecretsManager::from_env().map_err(Error::from)
}

fn ensure_dirs(config: &Config) -> Result<()> {
    for dir in [&config.data_dir, &config.logs_dir] {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let warnings = config.validate().into_result()?;
    for warning in &warnings {
        tracing::warn!("{}", warning);
    }
    ensure_dirs(&config)?;

    let secrets = Arc::new(load_secrets()?);
    let board: Arc<dyn BoardApi> = Arc::new(board_client(&config, &secrets)?);

    let identity = match config.sandbox.user() {
        Some(user) => ExecIdentity::restricted(user),
        None => ExecIdentity::current(),
    };
    let runner: Arc<dyn ProcessRunner> = Arc::new(
        SandboxedRunner::new(identity).with_base_env(secrets.environment_for(&[GITHUB_TOKEN])),
    );

    let config = Arc::new(config);
    let deps = PipelineDeps::new(config.clone(), board, runner, secrets.clone());

    let analysis = AnalysisPipeline::open(deps.clone()).await?;
    let development = if config.board.columns.development_enabled() {
        Some(DevelopmentPipeline::open(deps).await?)
    } else {
        tracing::info!("development pipeline disabled");
        None
    };

    tracing::info!(
        bot = %config.bot_name,
        board_id = %config.board.board_id,
        repo = %config.repo_dir.display(),
        sandbox_user = config.sandbox.user().unwrap_or("(none)"),
        secrets = secrets.secret_count(),
        "starting autopilot"
    );

    Driver::new(analysis, development, config.poll_interval())
        .run_until(shutdown_signal())
        .await;
    Ok(())
}

async fn print_status(config: &Config) -> Result<()> {
    let secrets = load_secrets()?;
    let board = board_client(config, &secrets)?;
    let report = status::collect(&board, config).await?;
    print!("{}", report);
    Ok(())
}

fn check_config(config: &Config) -> Result<()> {
    let result = config.validate();
    for warning in &result.warnings {
        println!("warning: {}", warning);
    }
    for error in &result.errors {
        println!("error: {}", error);
    }
    if result.is_valid() {
        println!("{}: OK", display_path(&config.repo_dir));
    }
    result.into_result().map(|_| ())
}

fn display_path(path: &Path) -> String {
    path.canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}
