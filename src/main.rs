use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use release_pilot::config::Settings;
use release_pilot::plugin::{PluginError, PluginManager};

mod commands;

use commands::{PluginCommand, plugin_command};

#[derive(Parser)]
#[command(
    name = "release-pilot",
    about = "Release automation whose integrations ship as installable plugins",
    version,
    author,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding installed plugins and their state
    #[arg(long, global = true, value_name = "DIR")]
    plugin_dir: Option<PathBuf>,

    /// Plugin registry URL or local path
    #[arg(long, global = true, value_name = "URL")]
    registry: Option<String>,

    /// Enable verbose output (use -vv for debug output)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover, install and manage plugins
    Plugin {
        #[command(subcommand)]
        command: PluginCommand,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbose flag
    init_logging(cli.verbose);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    match run(cli, &cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report(err),
    }
}

async fn run(cli: Cli, cancel: &CancellationToken) -> Result<()> {
    let mut settings = Settings::load()?;
    if let Some(dir) = cli.plugin_dir {
        settings.plugin_root = dir;
    }
    if let Some(registry) = cli.registry {
        settings.registry_url = registry;
    }
    tracing::debug!("Plugin root: {}", settings.plugin_root.display());

    match cli.command {
        Commands::Plugin { command } => {
            let manager = PluginManager::new(settings)?;
            plugin_command(&manager, command, cancel).await
        }
    }
}

fn report(err: anyhow::Error) -> ExitCode {
    match err.downcast::<PluginError>() {
        Ok(PluginError::Cancelled) => {
            eprintln!("Cancelled");
            ExitCode::from(130)
        }
        Ok(err) => {
            eprintln!("{:?}", miette::Report::new(err));
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("{:?}", miette::miette!("{err:#}"));
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbose {
        0 => EnvFilter::new("release_pilot=warn"), // Default: warnings and errors only
        1 => EnvFilter::new("release_pilot=info"), // -v: info messages
        _ => EnvFilter::new("release_pilot=debug"), // -vv or more: full debug
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}
