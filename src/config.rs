//! Configuration for the watch subsystem.
//!
//! Layered sources, later ones win:
//! - Default values
//! - `.watchhub/settings.toml` (searched from the current directory upwards)
//! - Environment variables
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `WATCHHUB_` and use double
//! underscores to separate nested levels:
//! - `WATCHHUB_WATCHER__MAX_WATCHES=4096` sets `watcher.max_watches`
//! - `WATCHHUB_BUS__BLOCK_ON_FULL=true` sets `bus.block_on_full`
//! - `WATCHHUB_SUPERVISOR__MAX_BACKOFF_MS=5000` sets `supervisor.max_backoff_ms`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bus::BusOptions;
use crate::watcher::BackoffPolicy;

const CONFIG_DIR: &str = ".watchhub";
const CONFIG_FILE: &str = "settings.toml";
const ENV_PREFIX: &str = "WATCHHUB_";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Watch registration limits
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Event bus tuning
    #[serde(default)]
    pub bus: BusConfig,

    /// Retry policy for supervised file watches
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Log levels
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WatcherConfig {
    /// Maximum number of concurrently registered watches
    #[serde(default = "default_max_watches")]
    pub max_watches: usize,

    /// Watch directory trees recursively
    #[serde(default = "default_true")]
    pub recursive: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BusConfig {
    /// Capacity of each subscriber's delivery buffer
    #[serde(default = "default_subscriber_buffer_size")]
    pub subscriber_buffer_size: usize,

    /// Wait for a full subscriber instead of dropping the event
    #[serde(default)]
    pub block_on_full: bool,

    /// How long to wait for a full subscriber, in milliseconds
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// First retry delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Default level for all modules
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module overrides, e.g. `watchhub = "debug"`
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_version() -> u32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_max_watches() -> usize {
    8192
}
fn default_subscriber_buffer_size() -> usize {
    100
}
fn default_write_timeout_ms() -> u64 {
    100
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    2000
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            watcher: WatcherConfig::default(),
            bus: BusConfig::default(),
            supervisor: SupervisorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            max_watches: default_max_watches(),
            recursive: true,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer_size: default_subscriber_buffer_size(),
            block_on_full: false,
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl BusConfig {
    /// Bus options for a bus called `name`.
    pub fn options(&self, name: &str) -> BusOptions {
        BusOptions {
            name: name.to_string(),
            subscriber_buffer_size: self.subscriber_buffer_size,
            block_on_full: self.block_on_full,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

impl SupervisorConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::doubling(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, still honoring env overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            // Double underscore separates nesting; single underscores stay in field names
            .merge(Env::prefixed(ENV_PREFIX).map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Find `.watchhub/settings.toml` from the current directory upwards
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        current
            .ancestors()
            .map(|ancestor| ancestor.join(CONFIG_DIR))
            .find(|dir| dir.is_dir())
            .map(|dir| dir.join(CONFIG_FILE))
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
