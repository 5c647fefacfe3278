//! evmapperd
//!
//! Grabs input devices and injects transformed events through virtual
//! output devices, controlled over a local socket.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use evmapper_config::ConfigDir;
use evmapper_daemon::daemon::Daemon;
use tracing_subscriber::EnvFilter;

/// Exit code when pre-flight setup fails (uinput, socket, config dir).
const EXIT_PREFLIGHT: u8 = 11;

#[derive(Parser, Debug)]
#[command(name = "evmapperd")]
#[command(about = "Input event mapping daemon")]
struct Args {
    /// Path to the configuration directory
    #[arg(short, long, default_value = "~/.config/evmapper")]
    config_dir: String,

    /// Log with debug verbosity
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config_dir: PathBuf = shellexpand::tilde(&args.config_dir).into_owned().into();
    tracing::info!("configuration directory: {}", config_dir.display());

    let daemon = match Daemon::new(ConfigDir::new(config_dir)) {
        Ok(daemon) => daemon,
        Err(error) => {
            tracing::error!("pre-flight failed: {error:#}");
            return ExitCode::from(EXIT_PREFLIGHT);
        }
    };

    match daemon.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!("daemon failed: {error:#}");
            ExitCode::FAILURE
        }
    }
}
