use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mode_core::state::SessionState;
use mode_exec::AuditSink;
use mode_exec::FileAuditSink;
use mode_exec::NullAuditSink;
use mode_exec::OllamaClient;
use mode_exec::ShellExecutor;
use tracing::info;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

mod config_loader;
mod menu;
mod runtime;
mod ui;

use config_loader::ModePaths;
use runtime::Services;

/// Exit status telling the shell wrapper to `cd` into the directory in `~/.mode/.mode_cd`.
const HANDOFF_EXIT_CODE: i32 = 42;
const LOG_ENV: &str = "MODE_LOG";
const LOG_FILE: &str = "mode.log";

#[derive(Parser, Debug)]
#[command(
    name = "mode",
    version,
    about = "Navigate your workflow from a menu or ask a local AI for shell commands"
)]
struct Cli {
    /// Config file to use instead of ~/.mode/config.toml.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Start the session in this directory.
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Log at debug level unless MODE_LOG says otherwise.
    #[arg(long)]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(Some(_)) => std::process::exit(HANDOFF_EXIT_CODE),
        Ok(None) => {}
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<Option<PathBuf>> {
    let home = dirs::home_dir();
    let paths = home.as_deref().map(ModePaths::under);
    let _log_guard = init_logging(paths.as_ref(), cli.debug)?;

    let config = config_loader::load(cli.config.as_deref(), home.as_deref())?;
    let cwd = match cli.cwd {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to read current directory")?,
    };
    let cwd = cwd
        .canonicalize()
        .with_context(|| format!("working directory {} is not accessible", cwd.display()))?;
    if !cwd.starts_with(config.assistant.base_path()) {
        warn!(
            cwd = %cwd.display(),
            base = %config.assistant.base_path().display(),
            "starting outside the allowed base path; chat commands will be denied"
        );
    }

    let model = OllamaClient::from_config(&config.assistant)?;
    let audit: Arc<dyn AuditSink> = match &paths {
        Some(paths) if config.assistant.log_commands => {
            Arc::new(FileAuditSink::new(paths.audit_log()))
        }
        _ => Arc::new(NullAuditSink),
    };
    let dispatcher = menu::ModeMenuDispatcher::new(
        config.interface.default_directory.clone(),
        home.clone(),
        paths.as_ref().map(|paths| paths.root.clone()),
    );
    let services = Services {
        model: Arc::new(model),
        executor: Arc::new(ShellExecutor::default()),
        audit,
        menu: Arc::new(dispatcher),
    };

    info!(
        cwd = %cwd.display(),
        model = %config.assistant.model,
        endpoint = %config.assistant.endpoint,
        "session starting"
    );
    let state = SessionState::new(Arc::new(config), cwd, Arc::new(menu::main_menu()));
    let handoff = ui::run(state, services).context("terminal session failed")?;
    info!(handoff = ?handoff, "session ended");

    match (handoff, &paths) {
        (Some(dir), Some(paths)) => {
            config_loader::write_handoff(paths, &dir)?;
            Ok(Some(dir))
        }
        (Some(dir), None) => {
            warn!(dir = %dir.display(), "no home directory to write the handoff file to");
            Ok(None)
        }
        (None, _) => Ok(None),
    }
}

/// Logs go to `~/.mode/logs/mode.log`; the terminal belongs to the UI.
fn init_logging(paths: Option<&ModePaths>, debug: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let Some(paths) = paths else {
        return Ok(None);
    };
    let dir = paths.log_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;

    let appender = tracing_appender::rolling::never(&dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    Ok(Some(guard))
}
