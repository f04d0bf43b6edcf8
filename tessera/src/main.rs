use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod config;
mod logging;
mod metrics;

#[derive(Parser)]
#[command(name = "tessera", about = "Filter-to-configuration mapping service")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the service.
    Serve {
        #[arg(long)]
        config: PathBuf,
    },
    /// Parse and validate a config file, then exit.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        CliCommand::Serve { config } => serve(&config),
        CliCommand::CheckConfig { config } => check_config(&config),
    }
}

fn check_config(path: &std::path::Path) -> ExitCode {
    match config::Config::from_file(path).and_then(|c| c.validate().map(|()| c)) {
        Ok(_) => {
            println!("{} is valid", path.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {e}", path.display());
            ExitCode::FAILURE
        }
    }
}

fn serve(path: &std::path::Path) -> ExitCode {
    let config = match config::Config::from_file(path).and_then(|c| c.validate().map(|()| c)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", path.display());
            return ExitCode::FAILURE;
        }
    };

    // Held for the lifetime of the process so buffered events are flushed on exit.
    let _sentry = logging::init(&config.common.logging);

    if let Some(metrics_config) = &config.common.metrics {
        if let Err(e) = metrics::init(metrics_config) {
            tracing::error!(error = %e, "Failed to install statsd exporter");
            return ExitCode::FAILURE;
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("Starting tessera");
    match runtime.block_on(mapping::run(config.server)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "tessera exited with an error");
            ExitCode::FAILURE
        }
    }
}
