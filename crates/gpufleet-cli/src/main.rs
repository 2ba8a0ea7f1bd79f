//! gpufleet CLI
//!
//! Offline tooling for fleet files: validate model declarations and
//! dry-run placement against a worker inventory.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// gpufleet - check and plan model deployments on a GPU fleet
#[derive(Parser, Debug)]
#[command(name = "gpufleet")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve backends, apply defaults and validate every declared model
    Validate {
        /// Fleet file (TOML)
        file: PathBuf,
    },

    /// Place the declared models on the declared workers without launching anything
    Plan {
        /// Fleet file (TOML)
        #[arg(long)]
        fleet: PathBuf,

        /// Print the planned instances as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the worker inventory and what is allocatable on it
    Workers {
        /// Fleet file (TOML)
        #[arg(long)]
        fleet: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match cli.command {
        Commands::Validate { file } => {
            commands::validate(&file)?;
        }
        Commands::Plan { fleet, json } => {
            commands::plan(&fleet, json).await?;
        }
        Commands::Workers { fleet } => {
            commands::workers(&fleet).await?;
        }
    }

    Ok(())
}
