// src/main.rs

use anyhow::Result;
use clap::{Parser, Subcommand};
use parcel::engine::{Engine, ProgressEvent};
use parcel::Config;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "parcel")]
#[command(author, version, about = "Package manager for embedded Linux systems", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short = 'f', long, default_value = "/etc/parcel/parcel.conf")]
    conf: PathBuf,

    /// Restrict the operation to one destination
    #[arg(long)]
    dest: Option<String>,

    /// Report what would happen without changing anything
    #[arg(long)]
    noaction: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the package lists of every configured source
    Update,
    /// Install a package and its dependencies
    Install {
        /// Package name
        package: String,
    },
    /// Remove an installed package
    Remove {
        /// Package name
        package: String,
    },
    /// Upgrade one installed package to its newest available version
    Upgrade {
        /// Package name
        package: String,
    },
    /// Upgrade every installed package, best effort
    UpgradeAll,
    /// List every known package
    List,
    /// List installed packages with a newer version available
    ListUpgradable,
    /// Show details of one package
    Info {
        /// Package name
        package: String,
        /// Match a specific version
        #[arg(long)]
        version: Option<String>,
    },
}

/// Progress sink printing a line per percentage change
fn print_progress(ev: &ProgressEvent) {
    let action = match ev.action {
        parcel::engine::Action::Download => "Downloading",
        parcel::engine::Action::Install => "Installing",
        parcel::engine::Action::Remove => "Removing",
    };
    match &ev.package {
        Some(pkg) => info!("{} {} ({}) ... {}%", action, pkg.name, pkg.version, ev.percent),
        None => info!("{} ... {}%", action, ev.percent),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut conf = Config::new();
    if cli.conf.exists() {
        conf.load_file(&cli.conf)?;
    } else {
        info!("No configuration file at {}, using defaults", cli.conf.display());
    }
    conf.default_dest = cli.dest;
    if cli.noaction {
        conf.options.noaction = true;
    }

    let mut engine = Engine::new(conf)?;
    let mut sink = print_progress;

    let result = match cli.command {
        Commands::Update => {
            engine.update_lists(&mut sink)?;
            println!("Package lists updated");
            Ok(())
        }
        Commands::Install { package } => {
            engine.install(&package, &mut sink)?;
            println!("Installed {}", package);
            Ok(())
        }
        Commands::Remove { package } => {
            engine.remove(&package, &mut sink)?;
            println!("Removed {}", package);
            Ok(())
        }
        Commands::Upgrade { package } => {
            engine.upgrade(&package, &mut sink)?;
            println!("Upgraded {}", package);
            Ok(())
        }
        Commands::UpgradeAll => {
            engine.upgrade_all(&mut sink)?;
            println!("All packages upgraded");
            Ok(())
        }
        Commands::List => {
            engine.list_packages(|pkg| {
                let mark = if pkg.installed { "*" } else { " " };
                println!("{} {} - {} [{}]", mark, pkg.name, pkg.version, pkg.architecture);
            });
            Ok(())
        }
        Commands::ListUpgradable => {
            engine.list_upgradable(|pkg| {
                println!("{} - {} [{}]", pkg.name, pkg.version, pkg.repository);
            });
            Ok(())
        }
        Commands::Info { package, version } => {
            match engine.find_package(&package, version.as_deref(), None, None) {
                Some(pkg) => {
                    println!("Package: {}", pkg.name);
                    println!("Version: {}", pkg.version);
                    println!("Architecture: {}", pkg.architecture);
                    if !pkg.repository.is_empty() {
                        println!("Repository: {}", pkg.repository);
                    }
                    if pkg.size_kb > 0 {
                        println!("Size: {} kB", pkg.size_kb);
                    }
                    if !pkg.tags.is_empty() {
                        println!("Tags: {}", pkg.tags);
                    }
                    if !pkg.description.is_empty() {
                        println!("Description: {}", pkg.description);
                    }
                    println!("Status: {}", if pkg.installed { "installed" } else { "not installed" });
                    Ok(())
                }
                None => Err(anyhow::anyhow!("Package '{}' not found", package)),
            }
        }
    };

    for warning in engine.take_warnings() {
        eprintln!("Warning: {}", warning);
    }

    result
}
