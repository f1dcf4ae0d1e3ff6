//! # partscan CLI
//!
//! The `partscan` binary normalizes and identifies component photos,
//! matches inventories against project catalogs, summarizes cost logs, and
//! runs the HTTP service.
//!
//! ## Usage
//!
//! ```bash
//! partscan --config ./config/partscan.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `partscan normalize <image>` | Resize, re-encode and fingerprint an image |
//! | `partscan identify <image>` | Identify the components in a photo |
//! | `partscan match` | Match an inventory against a project catalog |
//! | `partscan costs <log>` | Summarize a JSON Lines cost log |
//! | `partscan serve` | Start the HTTP server |
//!
//! The model credential is read from the environment variable named by
//! `[model].api_key_env` (`PARTSCAN_API_KEY` by default). Log verbosity is
//! controlled with `RUST_LOG`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use partscan::{commands, config, server};

/// partscan: camera-driven component identification and project matching.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means built-in defaults.
#[derive(Parser)]
#[command(
    name = "partscan",
    about = "Identify salvaged components from photos and match them to build projects",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/partscan.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize an image the way it is sent upstream.
    ///
    /// Prints the fingerprint and output dimensions. No network access.
    Normalize {
        /// JPEG or PNG input.
        image: PathBuf,

        /// Write the normalized JPEG here.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Identify the components in a photo.
    ///
    /// Requires the model credential. Each call that reaches upstream is
    /// appended to the cost log.
    Identify {
        image: PathBuf,

        /// User the scan is billed to.
        #[arg(long, default_value = "local")]
        user: String,
    },

    /// Match an inventory against a project catalog.
    Match {
        /// JSON array of components (`name`, `category`, `quantity`, `condition`).
        #[arg(long)]
        inventory: PathBuf,

        /// JSON array of projects (`id`, `name`, `required_components`).
        #[arg(long)]
        projects: PathBuf,

        #[arg(long, default_value = "local")]
        user: String,
    },

    /// Summarize a JSON Lines cost log per user.
    Costs {
        /// Cost log written by `identify`, `match` or the server.
        records: PathBuf,

        /// JSON object mapping user ids to display names.
        #[arg(long)]
        names: Option<PathBuf>,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "partscan=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Costs { records, names } = &cli.command {
        return commands::run_costs(records, names.as_deref());
    }

    let cfg = config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Normalize { image, out } => {
            commands::run_normalize(&cfg, &image, out.as_deref())?;
        }
        Commands::Identify { image, user } => {
            commands::run_identify(&cfg, &image, &user).await?;
        }
        Commands::Match {
            inventory,
            projects,
            user,
        } => {
            commands::run_match(&cfg, &inventory, &projects, &user).await?;
        }
        Commands::Serve => {
            tracing::info!("Starting partscan v{}", env!("CARGO_PKG_VERSION"));
            server::run_server(&cfg).await?;
        }
        Commands::Costs { .. } => {
            // Handled above (before config loading)
        }
    }

    Ok(())
}
