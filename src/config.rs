//! Configuration management for vpnctl.
//!
//! Configuration is applied in order: defaults → config file → command-line
//! arguments, with later sources overriding earlier ones.
//!
//! # Configuration Flow
//!
//! ```text
//!     ┌─────────────────┐
//!     │ Config::default │ ◄── Built-in defaults
//!     └────────┬────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐     ┌─────────────────┐
//!     │ Config file     │ ◄───│ vpnctl.toml     │  (TOML format)
//!     │ exists?         │     │ or --config     │
//!     └────────┬────────┘     └─────────────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐     ┌─────────────────┐
//!     │ Apply CLI args  │ ◄───│ --multihop      │
//!     │ (override)      │     │ --loglevel, etc.│
//!     └────────┬────────┘     └─────────────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐
//!     │ Validate        │
//!     └────────┬────────┘
//!              ▼
//!         Final Config
//! ```
//!
//! # Configuration Sources
//!
//! | Source | Priority | Description |
//! |--------|----------|-------------|
//! | Defaults | Lowest | Built-in defaults |
//! | Config File | Medium | TOML file (`--config` or `VPNCTL_CONFIG`) |
//! | CLI Arguments | Highest | Command-line flags override all |
//!
//! # Example Configuration File
//!
//! ```toml
//! loglevel = "notice"        # debug, info, notice, warn, error
//! # logfile = "/var/log/vpnctl.log"
//! # logfile = ":syslog:"
//! default_pause_secs = 300
//! # default_entry = "nl-ams-1"
//! # default_exit = "de-fra-1"
//!
//! [selection]
//! fastest_server = false
//! multihop = false
//! random_entry = false
//! random_exit = false
//!
//! [timing]
//! timer_tick_ms = 1000
//! fastest_poll_ms = 1000
//! fastest_poll_attempts = 1
//! random_selection_timeout_ms = 2000
//! key_retry_limit = 3
//!
//! [keys]
//! rotation_interval_hours = 168
//! hard_expiry_hours = 720
//! short_retry_secs = 60
//! regeneration_delay_ms = 500
//!
//! [backend]
//! connect_delay_ms = 800
//! disconnect_delay_ms = 200
//!
//! [[servers]]
//! id = "nl-ams-1"
//! name = "Amsterdam 1"
//! endpoint = "185.65.134.1:51820"
//! country_code = "NL"
//! ```
//!
//! # What This Module Does NOT Do
//!
//! - **Persistence**: settings changed at runtime are not written back
//! - **Config file watching**: changes require restart

use std::collections::HashSet;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::Server;

/// Log level for vpnctl output.
///
/// From most to least verbose:
/// [`Debug`](LogLevel::Debug) > [`Info`](LogLevel::Info) > [`Notice`](LogLevel::Notice) >
/// [`Warn`](LogLevel::Warn) > [`Error`](LogLevel::Error)
///
/// # Example
///
/// ```rust
/// use vpnctl::LogLevel;
///
/// let level: LogLevel = "warning".parse().unwrap();
/// assert_eq!(level, LogLevel::Warn);
/// assert!(LogLevel::Notice < level);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Low-level debugging information.
    Debug,
    /// Informational messages about normal operation.
    Info,
    /// Notable events that may be of interest.
    #[default]
    Notice,
    /// Warning conditions that don't prevent operation.
    Warn,
    /// Error conditions that may impair functionality.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Notice => write!(f, "NOTICE"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "NOTICE" => Ok(LogLevel::Notice),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" | "ERR" => Ok(LogLevel::Error),
            _ => Err(Error::Config(format!("invalid log level: {}", s))),
        }
    }
}

/// Server-resolution flags consulted on every connect attempt.
///
/// Fastest-server takes priority over random selection and is skipped when
/// multi-hop is enabled.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionSettings {
    /// Use the fastest-server cache for the entry server.
    #[serde(default)]
    pub fastest_server: bool,
    /// Route through an entry and an exit server.
    #[serde(default)]
    pub multihop: bool,
    /// Pick the entry server at random.
    #[serde(default)]
    pub random_entry: bool,
    /// Pick the exit server at random.
    #[serde(default)]
    pub random_exit: bool,
}

/// Controller timing parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimingConfig {
    /// Pause timer tick cadence in milliseconds.
    #[serde(default = "default_timer_tick_ms")]
    pub timer_tick_ms: u64,
    /// Delay between fastest-server cache polls in milliseconds.
    #[serde(default = "default_fastest_poll_ms")]
    pub fastest_poll_ms: u64,
    /// Polls to wait for a cached fastest server before using the default.
    #[serde(default = "default_fastest_poll_attempts")]
    pub fastest_poll_attempts: u32,
    /// Time to wait for random-server replies before using defaults.
    #[serde(default = "default_random_selection_timeout_ms")]
    pub random_selection_timeout_ms: u64,
    /// Consecutive recoverable key errors tolerated while idle.
    #[serde(default = "default_key_retry_limit")]
    pub key_retry_limit: u32,
}

fn default_timer_tick_ms() -> u64 {
    1000
}
fn default_fastest_poll_ms() -> u64 {
    1000
}
fn default_fastest_poll_attempts() -> u32 {
    1
}
fn default_random_selection_timeout_ms() -> u64 {
    2000
}
fn default_key_retry_limit() -> u32 {
    3
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            timer_tick_ms: default_timer_tick_ms(),
            fastest_poll_ms: default_fastest_poll_ms(),
            fastest_poll_attempts: default_fastest_poll_attempts(),
            random_selection_timeout_ms: default_random_selection_timeout_ms(),
            key_retry_limit: default_key_retry_limit(),
        }
    }
}

/// Settings for the local key controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeysConfig {
    /// Key age after which it is soft expired and rotated.
    #[serde(default = "default_rotation_interval_hours")]
    pub rotation_interval_hours: u32,
    /// Key age after which it can no longer be rotated.
    #[serde(default = "default_hard_expiry_hours")]
    pub hard_expiry_hours: u32,
    /// Delay of the short retry alarm.
    #[serde(default = "default_short_retry_secs")]
    pub short_retry_secs: u64,
    /// Simulated regeneration latency.
    #[serde(default = "default_regeneration_delay_ms")]
    pub regeneration_delay_ms: u64,
}

fn default_rotation_interval_hours() -> u32 {
    168
}
fn default_hard_expiry_hours() -> u32 {
    720
}
fn default_short_retry_secs() -> u64 {
    60
}
fn default_regeneration_delay_ms() -> u64 {
    500
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            rotation_interval_hours: default_rotation_interval_hours(),
            hard_expiry_hours: default_hard_expiry_hours(),
            short_retry_secs: default_short_retry_secs(),
            regeneration_delay_ms: default_regeneration_delay_ms(),
        }
    }
}

/// Settings for the simulated tunnel backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendConfig {
    /// Delay between `start` and the `Up` report.
    #[serde(default = "default_connect_delay_ms")]
    pub connect_delay_ms: u64,
    /// Delay between `stop` and the `Down` report.
    #[serde(default = "default_disconnect_delay_ms")]
    pub disconnect_delay_ms: u64,
}

fn default_connect_delay_ms() -> u64 {
    800
}
fn default_disconnect_delay_ms() -> u64 {
    200
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            connect_delay_ms: default_connect_delay_ms(),
            disconnect_delay_ms: default_disconnect_delay_ms(),
        }
    }
}

/// Main configuration for vpnctl.
///
/// # Example
///
/// ```rust
/// use vpnctl::Config;
///
/// let config = Config::default();
/// assert_eq!(config.default_pause_secs, 300);
/// assert!(!config.selection.multihop);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Minimum log level.
    #[serde(default)]
    pub loglevel: LogLevel,
    /// Log destination: a path, `:syslog:`, or unset for stdout.
    #[serde(default)]
    pub logfile: Option<String>,
    /// Pause duration used by the external `pause` action.
    #[serde(default = "default_pause_secs")]
    pub default_pause_secs: u64,
    /// Id of the default entry server.
    #[serde(default)]
    pub default_entry: Option<String>,
    /// Id of the default exit server.
    #[serde(default)]
    pub default_exit: Option<String>,
    /// Server-resolution flags.
    #[serde(default)]
    pub selection: SelectionSettings,
    /// Controller timing.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Local key controller settings.
    #[serde(default)]
    pub keys: KeysConfig,
    /// Simulated backend settings.
    #[serde(default)]
    pub backend: BackendConfig,
    /// Known servers.
    #[serde(default = "default_servers")]
    pub servers: Vec<Server>,
}

fn default_pause_secs() -> u64 {
    300
}
fn default_servers() -> Vec<Server> {
    vec![
        Server::new("nl-ams-1", "Amsterdam 1", "185.65.134.1:51820").with_country("NL"),
        Server::new("de-fra-1", "Frankfurt 1", "185.213.155.1:51820").with_country("DE"),
        Server::new("se-sto-1", "Stockholm 1", "185.195.233.1:51820").with_country("SE"),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loglevel: LogLevel::default(),
            logfile: None,
            default_pause_secs: default_pause_secs(),
            default_entry: None,
            default_exit: None,
            selection: SelectionSettings::default(),
            timing: TimingConfig::default(),
            keys: KeysConfig::default(),
            backend: BackendConfig::default(),
            servers: default_servers(),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read and
    /// [`Error::Config`] if it is not valid TOML.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Serializes the configuration to pretty TOML.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoServers`] when no server is configured,
    /// [`Error::Validation`] for a bad server entry or an unknown default id,
    /// and [`Error::Config`] for zero intervals.
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::NoServers);
        }
        let mut ids = HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !ids.insert(server.id.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate server id {}",
                    server.id
                )));
            }
        }
        for id in [&self.default_entry, &self.default_exit].into_iter().flatten() {
            if !ids.contains(id.as_str()) {
                return Err(Error::Validation(format!(
                    "default server {} is not configured",
                    id
                )));
            }
        }
        if self.timing.timer_tick_ms == 0 {
            return Err(Error::Config("timer_tick_ms must be positive".to_string()));
        }
        if self.timing.fastest_poll_ms == 0 {
            return Err(Error::Config("fastest_poll_ms must be positive".to_string()));
        }
        if self.keys.rotation_interval_hours > self.keys.hard_expiry_hours {
            return Err(Error::Config(
                "rotation_interval_hours must be <= hard_expiry_hours".to_string(),
            ));
        }
        Ok(())
    }
}

/// Command-line arguments for vpnctl.
#[derive(Parser, Debug)]
#[command(name = "vpnctl")]
#[command(about = "VPN connection controller")]
#[command(version)]
#[command(
    long_about = "vpnctl drives a VPN tunnel through connect, disconnect, pause, resume and \
    reconnect, reacting to key expiry and server-selection settings. Commands are read \
    from stdin."
)]
pub struct CliArgs {
    /// Write the effective configuration to FILE and exit.
    #[arg(long = "generate_config")]
    pub generate_config: Option<PathBuf>,

    /// Log level (debug, info, notice, warn, error).
    #[arg(long)]
    pub loglevel: Option<String>,

    /// Log destination: a file path or `:syslog:`.
    #[arg(long)]
    pub logfile: Option<String>,

    /// Path to the TOML config file.
    #[arg(long = "config", env = "VPNCTL_CONFIG", default_value = "vpnctl.toml")]
    pub config_file: PathBuf,

    /// Use the fastest server as entry.
    #[arg(long)]
    pub fastest_server: bool,

    /// Enable multi-hop routing.
    #[arg(long)]
    pub multihop: bool,

    /// Pick the entry server at random.
    #[arg(long)]
    pub random_entry: bool,

    /// Pick the exit server at random.
    #[arg(long)]
    pub random_exit: bool,

    /// Pause duration for the external `pause` action, in seconds.
    #[arg(long)]
    pub pause_secs: Option<u64>,

    /// Connect as soon as the controller starts.
    #[arg(long)]
    pub connect: bool,
}

impl CliArgs {
    /// Applies command-line overrides to `config`.
    ///
    /// An unparseable `--loglevel` is ignored.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(ref loglevel) = self.loglevel {
            if let Ok(level) = loglevel.parse() {
                config.loglevel = level;
            }
        }
        if let Some(ref logfile) = self.logfile {
            config.logfile = Some(logfile.clone());
        }
        if let Some(pause_secs) = self.pause_secs {
            config.default_pause_secs = pause_secs;
        }
        if self.fastest_server {
            config.selection.fastest_server = true;
        }
        if self.multihop {
            config.selection.multihop = true;
        }
        if self.random_entry {
            config.selection.random_entry = true;
        }
        if self.random_exit {
            config.selection.random_exit = true;
        }
    }
}

/// Loads configuration from every source and validates it.
///
/// # Errors
///
/// Returns any error of [`Config::from_file`] or [`Config::validate`].
pub fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = Config::default();

    if args.config_file.exists() {
        config = Config::from_file(&args.config_file)?;
    }

    args.apply_to(&mut config);
    config.validate()?;

    Ok(config)
}
