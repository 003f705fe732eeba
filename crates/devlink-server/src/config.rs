//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - TOML configuration file (`DEVLINK_CONFIG`, or the first of the default paths)
//! - Environment variables (`DEVLINK__PORT`, `DEVLINK__LIMITS__MAX_ROOMS`, ...)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file locations, first match wins.
const CONFIG_PATHS: [&str; 3] = [
    "devlink.toml",
    "/etc/devlink/devlink.toml",
    "~/.config/devlink/devlink.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Session behaviour.
    #[serde(default)]
    pub session: SessionConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Device bindings served by the built-in binding store.
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent rooms.
    #[serde(default = "default_max_rooms")]
    pub max_rooms: usize,

    /// Maximum sub devices per room.
    #[serde(default = "default_max_sub_devices")]
    pub max_sub_devices: usize,

    /// Frames queued per connection before a sub device is dropped.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds a main device may stay silent before its room is closed.
    #[serde(default = "default_main_idle_timeout")]
    pub main_idle_timeout_secs: u64,

    /// Header carrying the authenticated account ID.
    #[serde(default = "default_account_header")]
    pub account_header: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// One main device bound to an account, with its bound sub devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingConfig {
    /// Account ID.
    pub account: u64,
    /// Main device ID.
    pub main_device: u64,
    /// Sub device IDs bound to the main device.
    #[serde(default)]
    pub sub_devices: Vec<u64>,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_max_rooms() -> usize {
    100
}

fn default_max_sub_devices() -> usize {
    1
}

fn default_outbound_buffer() -> usize {
    devlink_core::peer::DEFAULT_OUTBOUND_BUFFER
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_main_idle_timeout() -> u64 {
    2 * 60 * 60 // 2 hours
}

fn default_account_header() -> String {
    "x-account-id".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            limits: LimitsConfig::default(),
            session: SessionConfig::default(),
            metrics: MetricsConfig::default(),
            bindings: Vec::new(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_rooms: default_max_rooms(),
            max_sub_devices: default_max_sub_devices(),
            outbound_buffer: default_outbound_buffer(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            main_idle_timeout_secs: default_main_idle_timeout(),
            account_header: default_account_header(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl SessionConfig {
    /// Main device idle timeout.
    #[must_use]
    pub fn main_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.main_idle_timeout_secs)
    }
}

impl Config {
    /// Load configuration from the first config file found, overlaid with
    /// `DEVLINK__*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = Self::find_file() {
            tracing::info!("Loading config from {}", path.display());
            builder = builder.add_source(
                ::config::File::from(path.as_path()).format(::config::FileFormat::Toml),
            );
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("DEVLINK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?;

        settings
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    fn find_file() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("DEVLINK_CONFIG") {
            return Some(PathBuf::from(shellexpand::tilde(&path).as_ref()));
        }

        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }
}
