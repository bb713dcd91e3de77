//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/livemap/config.toml)
//! 3. Environment variables (LIVEMAP_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::render::RenderStrategy;
use crate::sync::ConnectionConfig;

/// Environment variable prefix
const ENV_PREFIX: &str = "LIVEMAP";

/// Hub the client talks to when nothing else is configured
pub const DEFAULT_HUB_URL: &str = "http://localhost:5118/viewport";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Hub endpoint (http/https negotiates, ws/wss connects directly)
    #[serde(default = "default_hub_url")]
    pub hub_url: String,

    /// Reconciliation cadence in milliseconds
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    #[serde(default)]
    pub render_strategy: RenderStrategy,

    /// Drop points not updated for this many seconds (never if unset)
    #[serde(default)]
    pub point_ttl_secs: Option<u64>,

    /// Connect straight to the WebSocket endpoint without negotiating
    #[serde(default)]
    pub skip_negotiation: bool,

    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_keep_alive_interval_secs")]
    pub keep_alive_interval_secs: u64,

    /// Connection counts as lost after this long without hearing from the hub
    #[serde(default = "default_server_timeout_secs")]
    pub server_timeout_secs: u64,

    #[serde(default = "default_initial_reconnect_delay_ms")]
    pub initial_reconnect_delay_ms: u64,

    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    /// Give up reconnecting after this many failures (retry forever if unset)
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,

    /// Debug log destination (defaults to `<data_dir>/debug.log`)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Directory for logs and other local state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hub_url: default_hub_url(),
            refresh_interval_ms: default_refresh_interval_ms(),
            render_strategy: RenderStrategy::default(),
            point_ttl_secs: None,
            skip_negotiation: false,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            keep_alive_interval_secs: default_keep_alive_interval_secs(),
            server_timeout_secs: default_server_timeout_secs(),
            initial_reconnect_delay_ms: default_initial_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            max_reconnect_attempts: None,
            log_file: None,
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (LIVEMAP_HUB_URL, LIVEMAP_REFRESH_INTERVAL_MS, ...)
    /// 2. Config file (~/.config/livemap/config.toml or LIVEMAP_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        // LIVEMAP_HUB_URL
        if let Ok(val) = std::env::var(format!("{}_HUB_URL", ENV_PREFIX)) {
            if !val.is_empty() {
                self.hub_url = val;
            }
        }

        // LIVEMAP_REFRESH_INTERVAL_MS
        if let Ok(val) = std::env::var(format!("{}_REFRESH_INTERVAL_MS", ENV_PREFIX)) {
            self.refresh_interval_ms = val
                .parse()
                .with_context(|| format!("Invalid {}_REFRESH_INTERVAL_MS: {}", ENV_PREFIX, val))?;
        }

        // LIVEMAP_SKIP_NEGOTIATION
        if let Ok(val) = std::env::var(format!("{}_SKIP_NEGOTIATION", ENV_PREFIX)) {
            self.skip_negotiation = val.eq_ignore_ascii_case("true") || val == "1";
        }

        // LIVEMAP_POINT_TTL_SECS (empty clears it)
        if let Ok(val) = std::env::var(format!("{}_POINT_TTL_SECS", ENV_PREFIX)) {
            self.point_ttl_secs = if val.is_empty() {
                None
            } else {
                Some(
                    val.parse()
                        .with_context(|| format!("Invalid {}_POINT_TTL_SECS: {}", ENV_PREFIX, val))?,
                )
            };
        }

        // LIVEMAP_DATA_DIR
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        Ok(())
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default config file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with LIVEMAP_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("livemap")
            .join("config.toml")
    }

    /// Set a single field from its string form (used by `livemap config set`)
    ///
    /// Optional fields are cleared with an empty value or `none`.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let cleared = value.is_empty() || value.eq_ignore_ascii_case("none");

        match key {
            "hub_url" => {
                crate::sync::protocol::parse_hub_url(value)?;
                self.hub_url = value.to_string();
            }
            "refresh_interval_ms" => {
                let ms: u64 = parse_field(key, value)?;
                if ms == 0 {
                    bail!("refresh_interval_ms must be greater than zero");
                }
                self.refresh_interval_ms = ms;
            }
            "render_strategy" => {
                self.render_strategy = match value {
                    "full-rebuild" => RenderStrategy::FullRebuild,
                    "incremental" => RenderStrategy::Incremental,
                    other => bail!(
                        "Unknown render strategy '{}' (expected full-rebuild or incremental)",
                        other
                    ),
                };
            }
            "point_ttl_secs" => {
                self.point_ttl_secs = if cleared {
                    None
                } else {
                    Some(parse_field(key, value)?)
                };
            }
            "skip_negotiation" => self.skip_negotiation = parse_field(key, value)?,
            "handshake_timeout_secs" => self.handshake_timeout_secs = parse_field(key, value)?,
            "keep_alive_interval_secs" => self.keep_alive_interval_secs = parse_field(key, value)?,
            "server_timeout_secs" => self.server_timeout_secs = parse_field(key, value)?,
            "initial_reconnect_delay_ms" => {
                let ms: u64 = parse_field(key, value)?;
                if ms == 0 {
                    bail!("initial_reconnect_delay_ms must be greater than zero");
                }
                self.initial_reconnect_delay_ms = ms;
            }
            "max_reconnect_delay_ms" => self.max_reconnect_delay_ms = parse_field(key, value)?,
            "max_reconnect_attempts" => {
                self.max_reconnect_attempts = if cleared {
                    None
                } else {
                    Some(parse_field(key, value)?)
                };
            }
            "log_file" => {
                self.log_file = if cleared {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
            "data_dir" => self.data_dir = PathBuf::from(value),
            other => bail!("Unknown config key: {}", other),
        }

        Ok(())
    }

    /// Settings for the hub connection
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            url: self.hub_url.clone(),
            skip_negotiation: self.skip_negotiation,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            keep_alive_interval: Duration::from_secs(self.keep_alive_interval_secs.max(1)),
            server_timeout: Duration::from_secs(self.server_timeout_secs),
            initial_reconnect_delay: Duration::from_millis(self.initial_reconnect_delay_ms.max(1)),
            max_reconnect_delay: Duration::from_millis(self.max_reconnect_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }

    pub fn point_ttl(&self) -> Option<Duration> {
        self.point_ttl_secs.map(Duration::from_secs)
    }

    /// Get the path of the debug log
    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("debug.log"))
    }
}

fn parse_field<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Invalid value for {}: {}", key, value))
}

fn default_hub_url() -> String {
    DEFAULT_HUB_URL.to_string()
}

fn default_refresh_interval_ms() -> u64 {
    2000
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_keep_alive_interval_secs() -> u64 {
    15
}

fn default_server_timeout_secs() -> u64 {
    30
}

fn default_initial_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("livemap")
}
