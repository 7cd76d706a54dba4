//! Server selection policy.
//!
//! The controller never ranks servers itself. It asks a
//! [`ServerSelectionPolicy`] for one of three things:
//!
//! - the latest fastest-server observation ([`fastest_cached`](ServerSelectionPolicy::fastest_cached)),
//! - the static default for a role ([`default_server`](ServerSelectionPolicy::default_server)),
//! - a random server for a role, delivered asynchronously
//!   ([`request_random`](ServerSelectionPolicy::request_random)).
//!
//! # Fastest-Server Cache
//!
//! Latency probing is done by a separate subsystem that publishes its result
//! into a [`FastestServerCache`]. Readers always see the last value written;
//! staleness is acceptable.
//!
//! ```text
//!   ┌──────────────┐  publish   ┌────────────────────┐  latest   ┌────────────┐
//!   │ Prober       │ ─────────▶ │ FastestServerCache │ ────────▶ │ Controller │
//!   │ (external)   │            │ (watch cell)       │           │            │
//!   └──────────────┘            └────────────────────┘           └────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use vpnctl::selection::{fastest_server_cache, ServerSelectionPolicy, StaticServerList};
//! use vpnctl::{Server, ServerRole};
//!
//! let (publisher, cache) = fastest_server_cache();
//! let policy = StaticServerList::new(
//!     vec![
//!         Server::new("nl-ams-1", "Amsterdam 1", "10.0.0.1:51820"),
//!         Server::new("de-fra-1", "Frankfurt 1", "10.0.0.2:51820"),
//!     ],
//!     cache,
//! )?;
//!
//! assert!(policy.fastest_cached().is_none());
//! publisher.publish(Some(Server::new("de-fra-1", "Frankfurt 1", "10.0.0.2:51820")));
//! assert_eq!(policy.fastest_cached().map(|s| s.id), Some("de-fra-1".to_string()));
//! assert_eq!(policy.default_server(ServerRole::Entry).id, "nl-ams-1");
//! # Ok::<(), vpnctl::Error>(())
//! ```

use std::collections::HashSet;
use std::sync::Mutex;

use rand::seq::SliceRandom;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::state::{Server, ServerRole, ServerSelection};

/// One-shot reply slot for [`ServerSelectionPolicy::request_random`].
pub struct RandomServerReply {
    deliver: Box<dyn FnOnce(Server) + Send>,
}

impl RandomServerReply {
    /// Wraps a delivery closure.
    pub fn new(deliver: impl FnOnce(Server) + Send + 'static) -> Self {
        Self {
            deliver: Box::new(deliver),
        }
    }

    /// Delivers the chosen server.
    pub fn deliver(self, server: Server) {
        (self.deliver)(server)
    }
}

impl std::fmt::Debug for RandomServerReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomServerReply").finish_non_exhaustive()
    }
}

/// Resolves which servers a connect attempt uses.
///
/// Implementations use interior mutability; the controller holds them behind
/// an `Arc`.
pub trait ServerSelectionPolicy: Send + Sync {
    /// Returns the latest fastest-server observation, if any.
    fn fastest_cached(&self) -> Option<Server>;

    /// Returns the default server for `role`.
    fn default_server(&self, role: ServerRole) -> Server;

    /// Picks a random server for `role`, records it as current and hands it
    /// to `reply`, possibly later and from another thread.
    fn request_random(&self, role: ServerRole, reply: RandomServerReply);

    /// Records `server` as the current choice for `role`.
    fn set_current(&self, role: ServerRole, server: Server);

    /// Returns the current choice for `role`.
    fn current(&self, role: ServerRole) -> Option<Server>;
}

/// Writing side of the fastest-server cache, held by the prober.
#[derive(Debug)]
pub struct FastestServerPublisher {
    tx: watch::Sender<Option<Server>>,
}

impl FastestServerPublisher {
    /// Replaces the cached value. Last writer wins.
    pub fn publish(&self, server: Option<Server>) {
        self.tx.send_replace(server);
    }
}

/// Reading side of the fastest-server cache.
#[derive(Debug, Clone)]
pub struct FastestServerCache {
    rx: watch::Receiver<Option<Server>>,
}

impl FastestServerCache {
    /// Returns the last published value.
    pub fn latest(&self) -> Option<Server> {
        self.rx.borrow().clone()
    }
}

/// Creates an empty fastest-server cache.
pub fn fastest_server_cache() -> (FastestServerPublisher, FastestServerCache) {
    let (tx, rx) = watch::channel(None);
    (FastestServerPublisher { tx }, FastestServerCache { rx })
}

/// Selection policy over a fixed list of servers.
///
/// Random choice is uniform, excluding the server currently chosen for the
/// opposite role whenever another candidate exists so multi-hop routes never
/// use the same server twice.
#[derive(Debug)]
pub struct StaticServerList {
    servers: Vec<Server>,
    default_entry: usize,
    default_exit: usize,
    current: Mutex<ServerSelection>,
    fastest: FastestServerCache,
}

impl StaticServerList {
    /// Creates a policy. The first server is the default entry, the first
    /// other server the default exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoServers`] for an empty list and
    /// [`Error::Validation`] for invalid or duplicate servers.
    pub fn new(servers: Vec<Server>, fastest: FastestServerCache) -> Result<Self> {
        if servers.is_empty() {
            return Err(Error::NoServers);
        }
        let mut seen = HashSet::new();
        for server in &servers {
            server.validate()?;
            if !seen.insert(server.id.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate server id {}",
                    server.id
                )));
            }
        }

        let default_exit = if servers.len() > 1 { 1 } else { 0 };
        let current = ServerSelection {
            entry: Some(servers[0].clone()),
            exit: Some(servers[default_exit].clone()),
        };

        Ok(Self {
            servers,
            default_entry: 0,
            default_exit,
            current: Mutex::new(current),
            fastest,
        })
    }

    /// Creates a policy from the `[[servers]]` table and default ids of `config`.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new) and [`with_defaults`](Self::with_defaults).
    pub fn from_config(config: &Config, fastest: FastestServerCache) -> Result<Self> {
        Self::new(config.servers.clone(), fastest)?
            .with_defaults(config.default_entry.as_deref(), config.default_exit.as_deref())
    }

    /// Overrides the default servers by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if an id is not in the list.
    pub fn with_defaults(mut self, entry: Option<&str>, exit: Option<&str>) -> Result<Self> {
        if let Some(id) = entry {
            self.default_entry = self.index_of(id)?;
        }
        if let Some(id) = exit {
            self.default_exit = self.index_of(id)?;
        }
        let current = ServerSelection {
            entry: Some(self.servers[self.default_entry].clone()),
            exit: Some(self.servers[self.default_exit].clone()),
        };
        *self.current.get_mut().unwrap_or_else(|e| e.into_inner()) = current;
        Ok(self)
    }

    /// Returns the configured servers.
    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    /// Picks a random server for `role`.
    pub fn pick_random(&self, role: ServerRole) -> Server {
        let other = self.current(role.opposite());
        let candidates: Vec<&Server> = self
            .servers
            .iter()
            .filter(|s| other.as_ref().map_or(true, |o| o.id != s.id))
            .collect();

        let mut rng = rand::thread_rng();
        candidates
            .choose(&mut rng)
            .map(|s| (*s).clone())
            .unwrap_or_else(|| self.default_server(role))
    }

    fn index_of(&self, id: &str) -> Result<usize> {
        self.servers
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| Error::Validation(format!("unknown server id {}", id)))
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, ServerSelection> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ServerSelectionPolicy for StaticServerList {
    fn fastest_cached(&self) -> Option<Server> {
        self.fastest.latest()
    }

    fn default_server(&self, role: ServerRole) -> Server {
        match role {
            ServerRole::Entry => self.servers[self.default_entry].clone(),
            ServerRole::Exit => self.servers[self.default_exit].clone(),
        }
    }

    fn request_random(&self, role: ServerRole, reply: RandomServerReply) {
        let server = self.pick_random(role);
        self.set_current(role, server.clone());
        reply.deliver(server);
    }

    fn set_current(&self, role: ServerRole, server: Server) {
        let mut current = self.lock_current();
        match role {
            ServerRole::Entry => current.entry = Some(server),
            ServerRole::Exit => current.exit = Some(server),
        }
    }

    fn current(&self, role: ServerRole) -> Option<Server> {
        self.lock_current().get(role).cloned()
    }
}
