use anyhow::Result;
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use release_pilot::plugin::{
    AvailableList, Category, InstallOutcome, InstalledList, PluginError, PluginListEntry,
    PluginManager, PluginState,
};

#[derive(Debug, clap::Subcommand)]
pub enum PluginCommand {
    /// List installed plugins, or the registry catalog with --available
    List {
        /// Show every plugin in the registry
        #[arg(short, long)]
        available: bool,

        /// Fetch the registry even if the cached copy is fresh
        #[arg(short, long)]
        refresh: bool,
    },

    /// Install the latest version of a plugin
    Install { name: String },

    /// Upgrade an installed plugin to the registry's latest version
    Update { name: String },

    /// Remove an installed plugin
    #[command(alias = "remove")]
    Uninstall { name: String },

    /// Let release-pilot use an installed plugin
    Enable { name: String },

    /// Stop release-pilot from using a plugin
    Disable { name: String },

    /// Show details about a plugin
    Info { name: String },
}

pub async fn plugin_command(
    manager: &PluginManager,
    command: PluginCommand,
    cancel: &CancellationToken,
) -> Result<()> {
    match command {
        PluginCommand::List {
            available: true,
            refresh,
        } => {
            let list = manager.list_available(refresh, cancel).await?;
            print_available(&list);
        }
        PluginCommand::List {
            available: false,
            refresh,
        } => {
            if refresh {
                match manager.registry().refresh(cancel).await {
                    Ok(_) => {}
                    Err(PluginError::Cancelled) => return Err(PluginError::Cancelled.into()),
                    Err(err) => tracing::warn!("Registry refresh failed: {err}"),
                }
            }
            let list = manager.list_installed(cancel).await?;
            print_installed(&list);
        }
        PluginCommand::Install { name } => {
            let outcome = manager.install(&name, cancel).await?;
            print_outcome(&name, &outcome);
            if !matches!(outcome, InstallOutcome::AlreadyAtVersion { .. }) {
                println!(
                    "{}",
                    format!("Run `release-pilot plugin enable {name}` to activate it.").dimmed()
                );
            }
        }
        PluginCommand::Update { name } => {
            let outcome = manager.update(&name, cancel).await?;
            match outcome {
                InstallOutcome::AlreadyAtVersion { version } => {
                    println!("{} {name} {version} is up to date", "✓".green());
                }
                other => print_outcome(&name, &other),
            }
        }
        PluginCommand::Uninstall { name } => {
            manager.uninstall(&name, cancel).await?;
            println!("{} Uninstalled {name}", "✓".green());
        }
        PluginCommand::Enable { name } => {
            manager.enable(&name).await?;
            println!("{} Enabled {name}", "✓".green());
        }
        PluginCommand::Disable { name } => {
            manager.disable(&name).await?;
            println!("{} Disabled {name}", "✓".green());
        }
        PluginCommand::Info { name } => {
            let entry = manager.info(&name, cancel).await?;
            print_info(&entry);
        }
    }

    Ok(())
}

fn print_outcome(name: &str, outcome: &InstallOutcome) {
    match outcome {
        InstallOutcome::Installed { version } => {
            println!("{} Installed {name} {version}", "✓".green());
        }
        InstallOutcome::Upgraded { from, to } => {
            println!("{} Upgraded {name} {from} → {to}", "✓".green());
        }
        InstallOutcome::AlreadyAtVersion { version } => {
            println!("{} {name} {version} is already installed", "✓".green());
        }
    }
}

fn status_icon(state: PluginState) -> String {
    match state {
        PluginState::Enabled => "✓".green().to_string(),
        PluginState::Installed => "✗".red().to_string(),
        PluginState::UpdateAvailable => "⚠".yellow().to_string(),
        PluginState::NotInstalled => " ".to_string(),
    }
}

fn version_column(entry: &PluginListEntry) -> String {
    match (entry.state, entry.latest_version()) {
        (PluginState::UpdateAvailable, Some(latest)) => {
            format!("{} → {}", entry.version(), latest.yellow())
        }
        _ => entry.version().to_string(),
    }
}

fn print_installed(list: &InstalledList) {
    if list.entries.is_empty() {
        println!("No plugins installed.");
        println!(
            "{}",
            "Run `release-pilot plugin list --available` to browse the registry.".dimmed()
        );
        return;
    }

    let title = "Installed plugins:".bold();
    if list.stale {
        println!("{title} {}", "(cached, registry unreachable)".dimmed());
    } else {
        println!("{title}");
    }

    let width = name_width(&list.entries);
    for entry in &list.entries {
        print_row(entry, width);
    }
}

fn print_available(list: &AvailableList) {
    let title = "Available plugins:".bold();
    if list.stale {
        println!(
            "{title} {}",
            format!(
                "(cached, registry unreachable; fetched {})",
                list.fetched_at.format("%Y-%m-%d %H:%M UTC")
            )
            .dimmed()
        );
    } else {
        println!("{title}");
    }

    if list.entries.is_empty() {
        println!("  (none)");
        return;
    }

    let width = name_width(&list.entries);
    for category in Category::ALL {
        let entries: Vec<&PluginListEntry> = list
            .entries
            .iter()
            .filter(|entry| entry.category() == category)
            .collect();
        if entries.is_empty() {
            continue;
        }

        println!();
        println!("{}", format!("{}:", category.title()).cyan().bold());
        for entry in entries {
            print_row(entry, width);
        }
    }
}

fn print_row(entry: &PluginListEntry, width: usize) {
    println!(
        "  {} {:<width$}  {}  {}",
        status_icon(entry.state),
        entry.name(),
        version_column(entry),
        entry.description().dimmed(),
    );
}

fn name_width(entries: &[PluginListEntry]) -> usize {
    entries
        .iter()
        .map(|entry| entry.name().len())
        .max()
        .unwrap_or(0)
}

fn print_info(entry: &PluginListEntry) {
    println!("{}", entry.name().bold());

    if !entry.description().is_empty() {
        println!("  Description: {}", entry.description());
    }
    println!("  Category:    {}", entry.category().title());
    println!("  Status:      {} {}", status_icon(entry.state), entry.state);

    if let Some(installed) = &entry.installed {
        println!(
            "  Installed:   {} ({})",
            installed.version,
            installed.installed_at.format("%Y-%m-%d %H:%M UTC")
        );
        println!("  Path:        {}", installed.path.display());
    }

    match &entry.info {
        Some(info) => {
            println!("  Latest:      {}", info.version);
            let platforms: Vec<String> = info
                .platforms
                .iter()
                .map(|artifact| format!("{}/{}", artifact.os, artifact.arch))
                .collect();
            if !platforms.is_empty() {
                println!("  Platforms:   {}", platforms.join(", "));
            }
        }
        None => println!("  Latest:      {}", "unknown (not in registry)".dimmed()),
    }
}
