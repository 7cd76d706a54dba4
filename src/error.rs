//! Error types for vpnctl.
//!
//! This module defines the [`enum@Error`] enum for the failures that can occur
//! while building and configuring a controller. The connection state machine
//! itself never returns errors: failures during a connect attempt are reported
//! to listeners as [`ControllerEvent`](crate::ControllerEvent)s instead.
//!
//! # Error Categories
//!
//! ```text
//!   Error
//!   ├── Io                ◄── Config or log file I/O failures
//!   ├── Config            ◄── Invalid configuration
//!   ├── Validation        ◄── Invalid input data (server ids, country codes)
//!   └── NoServers         ◄── Server list is empty
//! ```
//!
//! # Recovery Guide
//!
//! | Error | Recoverable | Retry | Recommended Action |
//! |-------|-------------|-------|-------------------|
//! | [`Io`](Error::Io) | Sometimes | Yes | Check permissions and paths |
//! | [`Config`](Error::Config) | No | No | Fix configuration file |
//! | [`Validation`](Error::Validation) | No | No | Fix input data |
//! | [`NoServers`](Error::NoServers) | No | No | Add `[[servers]]` entries |
//!
//! # Example
//!
//! ```rust
//! use vpnctl::{Config, Error, Result};
//!
//! fn load_config() -> Result<Config> {
//!     let config = Config::from_file(std::path::Path::new("vpnctl.toml"))?;
//!     config.validate()?;
//!     Ok(config)
//! }
//!
//! fn main() {
//!     match load_config() {
//!         Ok(_) => println!("Config loaded successfully"),
//!         Err(Error::Io(e)) => eprintln!("File error: {}", e),
//!         Err(Error::Config(msg)) => eprintln!("Config error: {}", msg),
//!         Err(e) => eprintln!("Other error: {}", e),
//!     }
//! }
//! ```

use thiserror::Error;

/// Errors that can occur during vpnctl operations.
///
/// # Example
///
/// ```rust
/// use vpnctl::Error;
///
/// fn is_user_fixable(err: &Error) -> bool {
///     matches!(err, Error::Config(_) | Error::Validation(_) | Error::NoServers)
/// }
///
/// assert!(is_user_fixable(&Error::NoServers));
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error while reading configuration or opening log files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    ///
    /// Invalid configuration values or parsing failures. Not recoverable
    /// without user intervention.
    #[error("configuration error: {0}")]
    Config(String),

    /// Input validation error.
    #[error("validation error: {0}")]
    Validation(String),

    /// The server list handed to a selection policy is empty.
    #[error("no servers configured")]
    NoServers,
}

/// Result type alias for vpnctl operations.
pub type Result<T> = std::result::Result<T, Error>;
