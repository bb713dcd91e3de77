//! Config command handlers

use std::path::Path;

use anyhow::{Context, Result};

use livemap_core::Config;

use crate::output::{Output, OutputFormat};

fn load(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")
}

fn or_not_set<T: ToString>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "(not set)".to_string())
}

/// Show current configuration
pub fn show(config_path: Option<&Path>, output: &Output) -> Result<()> {
    let config = load(config_path)?;

    match output.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        OutputFormat::Quiet => {
            println!("{}", config.hub_url);
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .map(Path::to_path_buf)
                .unwrap_or_else(Config::config_file_path);
            let strategy = serde_json::to_value(config.render_strategy)?;

            println!("Configuration:");
            println!("  hub_url:                    {}", config.hub_url);
            println!("  refresh_interval_ms:        {}", config.refresh_interval_ms);
            println!(
                "  render_strategy:            {}",
                strategy.as_str().unwrap_or_default()
            );
            println!(
                "  point_ttl_secs:             {}",
                or_not_set(config.point_ttl_secs)
            );
            println!("  skip_negotiation:           {}", config.skip_negotiation);
            println!("  handshake_timeout_secs:     {}", config.handshake_timeout_secs);
            println!("  keep_alive_interval_secs:   {}", config.keep_alive_interval_secs);
            println!("  server_timeout_secs:        {}", config.server_timeout_secs);
            println!(
                "  initial_reconnect_delay_ms: {}",
                config.initial_reconnect_delay_ms
            );
            println!("  max_reconnect_delay_ms:     {}", config.max_reconnect_delay_ms);
            println!(
                "  max_reconnect_attempts:     {}",
                or_not_set(config.max_reconnect_attempts)
            );
            println!(
                "  log_file:                   {}",
                or_not_set(config.log_file.as_ref().map(|p| p.display()))
            );
            println!("  data_dir:                   {}", config.data_dir.display());
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, config_path: Option<&Path>, output: &Output) -> Result<()> {
    let mut config = load(config_path)?;
    config.set_value(&key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}
