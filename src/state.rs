//! Connection state and server descriptors.
//!
//! [`ConnectionState`] is the single source of truth the controller exposes to
//! listeners and to the notification layer. [`Server`] and
//! [`ServerSelection`] describe which endpoint(s) the tunnel backend should use
//! when it is started.
//!
//! # State Diagram
//!
//! ```text
//!                 connect                 tunnel up
//!  ┌──────────────┐ ───────▶ ┌────────────┐ ───────▶ ┌───────────┐
//!  │ NotConnected │          │ Connecting │          │ Connected │
//!  └──────────────┘ ◀─────── └────────────┘ ◀─────── └───────────┘
//!        ▲    ▲   tunnel down   │   ▲                   │    │
//!        │    │                 │   │ timer / resume    │    │ pause
//!        │    │   disconnect    ▼   │                   │    ▼
//!        │  ┌───────────────┐  ┌────────┐ tunnel down ┌─────────┐
//!        └──│ Disconnecting │  │ Paused │ ◀────────── │ Pausing │
//!           └───────────────┘  └────────┘             └─────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// VPN connection state.
///
/// Exactly one state is current at any time. The initial state is
/// [`NotConnected`](ConnectionState::NotConnected) and there is no terminal
/// state.
///
/// # Example
///
/// ```rust
/// use vpnctl::ConnectionState;
///
/// let state = ConnectionState::default();
/// assert_eq!(state, ConnectionState::NotConnected);
/// assert!(state.is_idle());
/// assert!(ConnectionState::Pausing.is_transient());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No tunnel is up and none is being established.
    #[default]
    NotConnected,
    /// The backend has been told to start and has not reported yet.
    Connecting,
    /// The backend reported the tunnel up.
    Connected,
    /// The backend has been told to stop on user request.
    Disconnecting,
    /// The backend has been told to stop for a timed pause.
    Pausing,
    /// The tunnel is down and the pause timer is counting.
    Paused,
}

impl ConnectionState {
    /// Returns `true` for states from which a user action starts a connect.
    pub fn is_idle(&self) -> bool {
        matches!(self, ConnectionState::NotConnected | ConnectionState::Paused)
    }

    /// Returns `true` while a tunnel is up or being brought up.
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    /// Returns `true` for the teardown states in which user actions are dropped.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectionState::Pausing | ConnectionState::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::NotConnected => write!(f, "NOT_CONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Disconnecting => write!(f, "DISCONNECTING"),
            ConnectionState::Pausing => write!(f, "PAUSING"),
            ConnectionState::Paused => write!(f, "PAUSED"),
        }
    }
}

/// Position of a server in the route.
///
/// Without multi-hop only the [`Entry`](ServerRole::Entry) server is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    /// The server the client connects to.
    Entry,
    /// The second hop of a multi-hop route.
    Exit,
}

impl ServerRole {
    /// Returns the other role.
    pub fn opposite(&self) -> ServerRole {
        match self {
            ServerRole::Entry => ServerRole::Exit,
            ServerRole::Exit => ServerRole::Entry,
        }
    }
}

impl std::fmt::Display for ServerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerRole::Entry => write!(f, "entry"),
            ServerRole::Exit => write!(f, "exit"),
        }
    }
}

/// Opaque server descriptor.
///
/// The controller never looks inside a server beyond logging its id; the
/// tunnel backend interprets `endpoint`.
///
/// # Example
///
/// ```rust
/// use vpnctl::Server;
///
/// let server = Server::new("de-fra-1", "Frankfurt 1", "185.186.78.1:51820");
/// assert!(server.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Server {
    /// Unique identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Endpoint string handed to the backend, usually `host:port`.
    pub endpoint: String,
    /// Two-letter country code.
    #[serde(default)]
    pub country_code: Option<String>,
}

impl Server {
    /// Creates a server without a country code.
    pub fn new(id: impl Into<String>, name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            endpoint: endpoint.into(),
            country_code: None,
        }
    }

    /// Sets the country code.
    pub fn with_country(mut self, code: impl Into<String>) -> Self {
        self.country_code = Some(code.into());
        self
    }

    /// Checks the descriptor fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the id or endpoint is empty, or the
    /// country code is not two ASCII letters.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Validation("server id must not be empty".to_string()));
        }
        if self.endpoint.trim().is_empty() {
            return Err(Error::Validation(format!(
                "server {} has an empty endpoint",
                self.id
            )));
        }
        if let Some(ref code) = self.country_code {
            if !is_valid_country_code(code) {
                return Err(Error::Validation(format!(
                    "server {} has invalid country code {:?}",
                    self.id, code
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Validates a two-character country code.
///
/// ```rust
/// use vpnctl::state::is_valid_country_code;
///
/// assert!(is_valid_country_code("de"));
/// assert!(is_valid_country_code("US"));
/// assert!(!is_valid_country_code("USA"));
/// assert!(!is_valid_country_code("1a"));
/// ```
pub fn is_valid_country_code(s: &str) -> bool {
    s.len() == 2 && s.chars().all(|c| c.is_ascii_alphabetic())
}

/// The servers the backend is started with.
///
/// `exit` is only set for multi-hop routes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerSelection {
    /// Entry server.
    pub entry: Option<Server>,
    /// Exit server, multi-hop only.
    pub exit: Option<Server>,
}

impl ServerSelection {
    /// Returns the server for `role`.
    pub fn get(&self, role: ServerRole) -> Option<&Server> {
        match role {
            ServerRole::Entry => self.entry.as_ref(),
            ServerRole::Exit => self.exit.as_ref(),
        }
    }

    /// Returns `true` when both hops are set.
    pub fn is_multihop(&self) -> bool {
        self.entry.is_some() && self.exit.is_some()
    }
}

impl std::fmt::Display for ServerSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.entry, &self.exit) {
            (Some(entry), Some(exit)) => write!(f, "{} -> {}", entry.id, exit.id),
            (Some(entry), None) => write!(f, "{}", entry.id),
            (None, Some(exit)) => write!(f, "? -> {}", exit.id),
            (None, None) => write!(f, "<none>"),
        }
    }
}
