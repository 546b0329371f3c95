mod app;
mod cli;
mod error;
mod mcp;
mod model;
mod plugin;
mod spinner;

use std::path::Path;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use app::App;
use cli::Cli;
use model::config::AppConfig;
use model::paths::Locations;

const LOG_ENV: &str = "CODEX_MARKET_LOG";

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load()?;
    let locations = Locations::from_config(&config);

    // Held until exit so buffered log lines are flushed.
    let _guard = init_logging(&config, locations.data_dir())?;
    tracing::info!("codex-market {} starting", env!("CARGO_PKG_VERSION"));
    match &config.source {
        Some(path) => tracing::debug!("loaded user config from {}", path.display()),
        None => tracing::debug!("no user config, using defaults"),
    }

    let app = App::new(config, locations)?;
    let result = app.run(cli.command);
    if let Err(e) = &result {
        tracing::warn!("command failed: {e:#}");
    }
    result
}

/// Logs go to a daily file in the data directory, never stdout.
fn init_logging(config: &AppConfig, log_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "codex-market.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(format!("codex_market={}", config.general.log_level)));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_env_filter(filter)
        .init();

    Ok(guard)
}
