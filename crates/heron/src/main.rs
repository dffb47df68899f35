pub(crate) mod cli;
mod commands;
mod format;
mod wiring;

use std::process::ExitCode;

use clap::Parser;

use cli::{Cli, Command};
use wiring::Runtime;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => cli.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // Hold the non-blocking guards for the lifetime of main so logs flush on exit.
    let _log_guards = match init_logging(env_filter, cli.log_file.as_deref()) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("Error: logging: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let result = tokio::runtime::Runtime::new()
        .map_err(anyhow::Error::from)
        .and_then(|rt| rt.block_on(async_main(cli)));

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::debug!(error = ?e, "Command failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn async_main(cli: Cli) -> anyhow::Result<bool> {
    let rt = Runtime::load(cli.config.as_deref())?;
    let json = cli.json;
    match &cli.command {
        Command::Setup(args) => commands::pki::setup(&rt, args, json).await,
        Command::Status => commands::pki::status(&rt, json).await,
        Command::Renew { identities } => commands::pki::renew(&rt, identities, json).await,
        Command::Verify => commands::pki::verify(&rt, json).await,
        Command::Migrate(args) => commands::migrate::run(&rt, args, json).await,
    }
}

/// Initialize the tracing subscriber with non-blocking stderr and an
/// optional appended log file.
pub(crate) fn init_logging(
    env_filter: tracing_subscriber::EnvFilter,
    log_file: Option<&std::path::Path>,
) -> anyhow::Result<Vec<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::prelude::*;

    let (nb_stderr, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(nb_stderr);

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let (nb_file, file_guard) = tracing_appender::non_blocking(file);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(nb_file);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();

        Ok(vec![stderr_guard, file_guard])
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();

        Ok(vec![stderr_guard])
    }
}
