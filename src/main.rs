use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use panel_plugins::config::DependencyConfig;
use panel_plugins::{Config, PluginManager};

/// Panel plugin manager - install, remove and toggle admin panel plugins
#[derive(Parser)]
#[command(name = "panel-plugin", version, about)]
struct Cli {
    /// Plugin directory (overrides config file and defaults)
    #[arg(long, env = "PANEL_PLUGINS_DIR")]
    plugins_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Install a plugin package (zip with one plugin directory)
    Install {
        /// Path to the package archive
        archive: PathBuf,
    },
    /// Uninstall a plugin by directory name
    Uninstall {
        /// Plugin directory name
        name: String,
    },
    /// Enable a plugin
    Enable {
        /// Plugin name
        name: String,
    },
    /// Disable a plugin
    Disable {
        /// Plugin name
        name: String,
    },
    /// Flip a plugin between enabled and disabled
    Toggle {
        /// Plugin name
        name: String,
    },
    /// Re-run discovery and activation
    Reload,
    /// List installed plugins
    List {
        /// Show enabled state and problems
        #[arg(short, long)]
        long: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn,panel_plugins=info",
        1 => "info,panel_plugins=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    let config = match cli.plugins_dir {
        Some(dir) if dir != config.plugins_dir => {
            let defaults = Config::for_dir(dir);
            Config {
                dependencies: DependencyConfig {
                    auto_install: config.dependencies.auto_install,
                    install_command: config.dependencies.install_command,
                    ..defaults.dependencies
                },
                hook_timeout: config.hook_timeout,
                ..defaults
            }
        }
        _ => config,
    };

    let manager = PluginManager::new(config);
    if !matches!(cli.command, Command::Reload) {
        // Bring the catalog in line with disk before acting on it
        manager.reload().await?;
    }

    match cli.command {
        Command::Install { archive } => {
            let archive = std::fs::canonicalize(&archive).unwrap_or(archive);
            let name = manager.install(&archive).await?;
            println!("Plugin {name} installed successfully.");
        }
        Command::Uninstall { name } => {
            manager.uninstall(&name).await?;
            println!("Plugin {name} uninstalled successfully.");
        }
        Command::Enable { name } => {
            manager.set_enabled(&name, true).await?;
            println!("Plugin {name} enabled.");
        }
        Command::Disable { name } => {
            manager.set_enabled(&name, false).await?;
            println!("Plugin {name} disabled.");
        }
        Command::Toggle { name } => {
            let enabled = manager.toggle(&name).await?;
            println!(
                "Plugin {name} {}.",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        Command::Reload => {
            let report = manager.reload().await?;
            println!(
                "Loaded {} plugin(s), {} active, {} error(s).",
                report.discovered,
                report.active,
                report.errors.len()
            );
        }
        Command::List { long } => print_list(&manager, long),
    }

    Ok(())
}

fn print_list(manager: &PluginManager, long: bool) {
    let catalog = manager.catalog();
    if catalog.plugins.is_empty() {
        println!("No plugins installed.");
        return;
    }

    for plugin in &catalog.plugins {
        if !long {
            println!("{}", plugin.name());
            continue;
        }
        let state = match (plugin.enabled, plugin.active) {
            (true, true) => "active",
            (true, false) => "enabled",
            (false, _) => "disabled",
        };
        println!(
            "{:<24} {:<10} {:<9} {}",
            plugin.name(),
            plugin.manifest.version(),
            state,
            plugin.directory_name
        );
        for problem in &plugin.problems {
            println!("    - {problem}");
        }
    }
}
