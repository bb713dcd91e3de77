//! livemap CLI
//!
//! Command-line front end for livemap - watch a hub's live point set, send
//! messages and push point updates.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use livemap_core::{Category, Config};

mod commands;
mod output;

use commands::watch::WatchOptions;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "livemap")]
#[command(about = "livemap - Real-time point sync with a map hub")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and render live points until Ctrl-C
    Watch {
        /// Hub URL (overrides hub_url)
        #[arg(long)]
        url: Option<String>,
        /// Refresh interval in milliseconds (overrides refresh_interval_ms)
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Only redraw markers that changed
        #[arg(long)]
        incremental: bool,
    },
    /// Broadcast a text message through the hub
    Send {
        /// Message text
        text: String,
    },
    /// Publish a point update through the hub
    #[command(allow_negative_numbers = true)]
    Push {
        /// Point id (device IMEI)
        id: String,
        /// Latitude in degrees
        lat: f64,
        /// Longitude in degrees
        lng: f64,
        /// Category: R or G
        category: Category,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (hub_url, refresh_interval_ms, render_strategy, ...)
        key: String,
        /// Configuration value (empty or "none" clears optional keys)
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_deref();

    // Config commands work on the file, not a connection
    if let Commands::Config { command } = cli.command {
        return match command {
            Some(ConfigCommands::Show) | None => commands::config::show(config_path, &output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, config_path, &output)
            }
        };
    }

    let config = load_config(config_path)?;
    init_logging(&config);

    match cli.command {
        Commands::Watch {
            url,
            interval_ms,
            incremental,
        } => {
            let options = WatchOptions {
                url,
                interval_ms,
                incremental,
            };
            commands::watch::watch(config, options, output).await
        }
        Commands::Send { text } => commands::send::send(config, text, &output).await,
        Commands::Push {
            id,
            lat,
            lng,
            category,
        } => commands::send::push(config, id, lat, lng, category, &output).await,
        Commands::Config { .. } => Ok(()),
    }
}

fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")
}

/// Initialize file-based logging
///
/// Only initializes if LIVEMAP_LOG environment variable is set.
/// Logs to file (config.log_file or default {data_dir}/debug.log).
fn init_logging(config: &Config) {
    let Ok(log_level) = std::env::var("LIVEMAP_LOG") else {
        return;
    };

    let log_path = config.log_path();

    let log_file = match File::create(&log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not create log file {:?}: {}", log_path, e);
            return;
        }
    };

    let env_filter = EnvFilter::new(format!(
        "livemap_core={},livemap_cli={}",
        log_level, log_level
    ));

    // Ignore error if already initialized
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(log_file)
        .try_init();

    info!("Logging initialized to {:?}", log_path);
}
