//! # vpnctl
//!
//! Client-side VPN connection controller.
//!
//! # Overview
//!
//! vpnctl owns the lifecycle of a single VPN tunnel as one serialized state
//! machine. It turns user intents (connect, disconnect, pause, resume) and
//! collaborator callbacks (tunnel status, key regeneration results, pause
//! timer) into a consistent [`ConnectionState`] and an ordered stream of
//! [`ControllerEvent`]s.
//!
//! - **Connect flow** ([`controller`]): fastest, random or configured server
//!   resolution before the tunnel is started
//! - **Timed pause** ([`timer`]): tunnel down for a fixed duration, then
//!   automatic resume
//! - **Key expiry** ([`keys`]): expired credentials are regenerated before
//!   connecting, with soft and fatal failure handling
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`controller`] | [`ConnectionController`] task and its [`ControllerHandle`] |
//! | [`state`] | Connection states, servers and selections |
//! | [`event`] | Events, notification signals and external actions |
//! | [`listeners`] | State listener registry and [`Subscription`]s |
//! | [`timer`] | Pause countdown with periodic ticks |
//! | [`selection`] | Server selection policy and fastest-server cache |
//! | [`backend`] | Tunnel backend boundary and a simulated backend |
//! | [`keys`] | Key controller boundary and a local key controller |
//! | [`notification`] | Notification sink boundary |
//! | [`config`] | Configuration management (TOML, CLI, environment) |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`logger`] | Logging infrastructure using tracing |
//!
//! # What This Library Does NOT Do
//!
//! - **Tunnel cryptography**: the [`backend::TunnelBackend`] owns the tunnel
//! - **Key provisioning**: the [`keys::KeyController`] talks to the key service
//! - **UI rendering**: the [`notification::NotificationSink`] presents signals
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use vpnctl::backend::SimulatedBackend;
//! use vpnctl::keys::LocalKeyController;
//! use vpnctl::notification::LogNotificationSink;
//! use vpnctl::selection::{fastest_server_cache, StaticServerList};
//! use vpnctl::{Collaborators, Config, ConnectionController, ControllerSettings};
//!
//! #[tokio::main]
//! async fn main() -> vpnctl::Result<()> {
//!     let config = Config::default();
//!     let (_publisher, cache) = fastest_server_cache();
//!
//!     let handle = ConnectionController::spawn(
//!         ControllerSettings::from_config(&config),
//!         Collaborators {
//!             backend: Arc::new(SimulatedBackend::from_config(&config.backend)),
//!             keys: Arc::new(LocalKeyController::new(&config.keys)),
//!             policy: Arc::new(StaticServerList::from_config(&config, cache)?),
//!             notifications: Arc::new(LogNotificationSink),
//!             actions: None,
//!         },
//!     );
//!
//!     let mut events = handle.add_state_listener();
//!     handle.action_by_user();
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Configuration can be loaded from multiple sources in order of precedence:
//!
//! ```text
//! ┌─────────────────┐
//! │   CLI Arguments │ ◄── Highest priority (overrides all)
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   Environment   │ ◄── VPNCTL_CONFIG
//! │    Variables    │
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   Config File   │ ◄── TOML file (default: vpnctl.toml)
//! │     (TOML)      │
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │    Defaults     │
//! └─────────────────┘
//! ```
//!
//! See [`Config`] for all available options.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod keys;
pub mod listeners;
pub mod logger;
pub mod notification;
pub mod selection;
pub mod state;
pub mod timer;

pub use config::{CliArgs, Config, LogLevel, SelectionSettings};
pub use controller::{
    Collaborators, ConnectionController, ControllerHandle, ControllerSettings, ControllerSnapshot,
};
pub use error::{Error, Result};
pub use event::{
    ControllerEvent, ExternalAction, NotificationSignal, RegenerationErrorKind,
    ServerChoiceReason, TunnelStatus,
};
pub use listeners::{ListenerId, Subscription};
pub use state::{ConnectionState, Server, ServerRole, ServerSelection};

/// Crate version, as reported at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
