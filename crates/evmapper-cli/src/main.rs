//! evmapper CLI
//!
//! Control tool for the evmapper daemon: list device groups, start and stop
//! injections, trigger autoload and validate presets without the daemon.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use evmapper_config::{compile_preset, ConfigDir, SymbolTable};
use evmapper_daemon::ipc::{self, IpcRequest, IpcResponse};
use miette::{miette, IntoDiagnostic};

#[derive(Parser, Debug)]
#[command(name = "evmapper")]
#[command(about = "Control tool for the evmapper daemon")]
#[command(version)]
struct Cli {
    /// Path to the configuration directory
    #[arg(short, long, default_value = "~/.config/evmapper")]
    config_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that the daemon is reachable
    Hello,

    /// List device groups and their injection status
    Groups,

    /// Start injecting a preset for a device group
    ///
    /// Examples:
    ///   evmapper start "My Keyboard" gaming
    Start {
        /// Group key as shown by `evmapper groups`
        group_key: String,
        /// Preset name under presets/<group>/
        preset_name: String,
    },

    /// Stop the injection for a device group
    Stop {
        /// Group key as shown by `evmapper groups`
        group_key: String,
    },

    /// Start every (group, preset) pair from the autoload configuration
    Autoload,

    /// Point the daemon at a different configuration directory
    #[command(name = "set-config-dir")]
    SetConfigDir {
        path: PathBuf,
    },

    /// Validate a preset file without starting the daemon
    ///
    /// Examples:
    ///   evmapper validate "My Keyboard" gaming
    Validate {
        /// Group directory under presets/
        group: String,
        /// Preset name
        preset_name: String,
    },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config_dir: PathBuf = shellexpand::tilde(&cli.config_dir).into_owned().into();

    match cli.command {
        Commands::Hello => {
            let response = send(IpcRequest::Hello).await?;
            expect_ok(response, |response| match response {
                IpcResponse::Hello => {
                    println!("daemon is running");
                    true
                }
                _ => false,
            })
        }
        Commands::Groups => {
            let response = send(IpcRequest::ListGroups).await?;
            expect_ok(response, |response| match response {
                IpcResponse::Groups { groups } => {
                    if groups.is_empty() {
                        println!("no device groups found");
                    }
                    for group in groups {
                        println!("\"{}\" [{}]", group.group_key, group.status);
                        for path in &group.sub_device_paths {
                            println!("    {}", path.display());
                        }
                    }
                    true
                }
                _ => false,
            })
        }
        Commands::Start {
            group_key,
            preset_name,
        } => {
            let response = send(IpcRequest::StartInjection {
                group_key,
                preset_name,
            })
            .await?;
            expect_ok(response, |response| match response {
                IpcResponse::Accepted => {
                    println!("injection started");
                    true
                }
                _ => false,
            })
        }
        Commands::Stop { group_key } => {
            let response = send(IpcRequest::StopInjection { group_key }).await?;
            expect_ok(response, |response| matches!(response, IpcResponse::Ok))
        }
        Commands::Autoload => {
            let response = send(IpcRequest::Autoload {
                config_dir: Some(config_dir),
            })
            .await?;
            expect_ok(response, |response| matches!(response, IpcResponse::Ok))
        }
        Commands::SetConfigDir { path } => {
            let response = send(IpcRequest::SetConfigDir { path }).await?;
            expect_ok(response, |response| matches!(response, IpcResponse::Ok))
        }
        Commands::Validate { group, preset_name } => cmd_validate(&config_dir, &group, &preset_name),
    }
}

async fn send(request: IpcRequest) -> miette::Result<IpcResponse> {
    ipc::request(&ipc::socket_path(), &request)
        .await
        .map_err(|e| miette!("{e:#}"))
}

/// Map a response onto the process result; `matched` prints on success.
fn expect_ok(
    response: IpcResponse,
    matched: impl FnOnce(IpcResponse) -> bool,
) -> miette::Result<()> {
    match response {
        IpcResponse::Rejected { reason } => Err(miette!("rejected: {reason}")),
        IpcResponse::Error { message } => Err(miette!("daemon error: {message}")),
        other => {
            if matched(other) {
                Ok(())
            } else {
                Err(miette!("unexpected response from daemon"))
            }
        }
    }
}

/// Load and validate a preset locally, reporting every problem found.
fn cmd_validate(config_dir: &PathBuf, group: &str, preset_name: &str) -> miette::Result<()> {
    let config_dir = ConfigDir::new(config_dir);

    let mut symbols = SymbolTable::new();
    if let Ok(overrides) = config_dir.load_xmodmap() {
        symbols.apply_overrides(&overrides);
    }

    let preset = config_dir
        .load_preset(group, preset_name)
        .into_diagnostic()?;

    match compile_preset(&preset, &symbols) {
        Ok(compiled) => {
            println!(
                "preset \"{preset_name}\" is valid: {} mapping(s)",
                compiled.mappings.len()
            );
            for (index, error) in &compiled.disabled {
                println!("warning: mapping {index} disabled:");
                eprintln!("{:?}", miette::Report::new(error.clone()));
            }
            Ok(())
        }
        Err(invalid) => {
            for error in &invalid.errors {
                println!("mapping {}: {}", error.index, error.reason);
            }
            Err(miette!("preset \"{preset_name}\" is invalid"))
        }
    }
}
