//! Events and signals exchanged at the controller's boundaries.
//!
//! - [`ControllerEvent`]: everything a state listener can observe.
//! - [`NotificationSignal`]: the reduced set sent to the presentation layer.
//! - [`ExternalAction`]: named actions arriving from notification buttons or IPC.
//! - [`TunnelStatus`]: what the tunnel backend reports.

use std::time::Duration;

use crate::state::{ConnectionState, Server, ServerRole};

/// Why a server was pushed to listeners before a connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerChoiceReason {
    /// Picked from the fastest-server cache, or the default server when the
    /// cache stayed empty.
    Fastest,
    /// Picked by random selection.
    Random,
}

/// Error kinds surfaced to listeners when key regeneration fails.
///
/// Each kind maps to a distinct dialog in the presentation layer. None of
/// them is retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegenerationErrorKind {
    /// The key is unknown to the server or hard expired; the user must
    /// upgrade or log in again.
    UpgradeRequired,
    /// The account already holds the maximum number of keys.
    MaximumKeysReached,
    /// Recoverable failures repeated past the configured retry limit.
    RetriesExhausted,
}

impl std::fmt::Display for RegenerationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegenerationErrorKind::UpgradeRequired => write!(f, "upgrade required"),
            RegenerationErrorKind::MaximumKeysReached => write!(f, "maximum keys reached"),
            RegenerationErrorKind::RetriesExhausted => write!(f, "retries exhausted"),
        }
    }
}

/// Event delivered to every registered state listener.
///
/// # Example
///
/// ```rust
/// use vpnctl::{ConnectionState, ControllerEvent};
///
/// let event = ControllerEvent::StateChanged(ConnectionState::Connected);
/// assert_eq!(event.state(), Some(ConnectionState::Connected));
/// assert_eq!(ControllerEvent::CheckSession.state(), None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// The connection state changed, or was replayed on subscribe/refresh.
    StateChanged(ConnectionState),
    /// The pause timer ticked.
    TimerTick {
        /// Time left until auto-resume.
        remaining: Duration,
    },
    /// The pause timer elapsed naturally.
    TimerFinished,
    /// The controller is waiting for a fastest-server result.
    FindingFastestServer,
    /// A server was chosen for a role before a connect attempt.
    ServerChosen {
        /// The chosen server.
        server: Server,
        /// The role it fills.
        role: ServerRole,
        /// How it was chosen.
        reason: ServerChoiceReason,
    },
    /// Key regeneration started.
    KeyRegenerating,
    /// Key regeneration succeeded.
    KeyRegenerated,
    /// Key regeneration failed fatally for this attempt.
    KeyRegenerationError(RegenerationErrorKind),
    /// The tunnel went down; the session should be re-validated.
    CheckSession,
}

impl ControllerEvent {
    /// Returns the state carried by a [`StateChanged`](ControllerEvent::StateChanged) event.
    pub fn state(&self) -> Option<ConnectionState> {
        match self {
            ControllerEvent::StateChanged(state) => Some(*state),
            _ => None,
        }
    }
}

/// Signal sent to the notification layer on state changes.
///
/// `Pausing` and `Disconnecting` have no signal. Sinks must tolerate
/// duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationSignal {
    /// Tunnel is down.
    Disconnected,
    /// Tunnel is being established.
    Connecting,
    /// Tunnel is up.
    Connected,
    /// Tunnel is paused.
    Paused {
        /// Time left until auto-resume.
        remaining: Duration,
    },
}

impl NotificationSignal {
    /// Maps a state to its signal.
    pub fn for_state(state: ConnectionState, remaining: Duration) -> Option<Self> {
        match state {
            ConnectionState::NotConnected => Some(NotificationSignal::Disconnected),
            ConnectionState::Connecting => Some(NotificationSignal::Connecting),
            ConnectionState::Connected => Some(NotificationSignal::Connected),
            ConnectionState::Paused => Some(NotificationSignal::Paused { remaining }),
            ConnectionState::Disconnecting | ConnectionState::Pausing => None,
        }
    }
}

/// Named action delivered by an external source.
///
/// # Example
///
/// ```rust
/// use vpnctl::ExternalAction;
///
/// assert_eq!(ExternalAction::parse("pause"), Some(ExternalAction::Pause));
/// assert_eq!(ExternalAction::parse(" RECONNECT "), Some(ExternalAction::Reconnect));
/// assert_eq!(ExternalAction::parse("launch_rockets"), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalAction {
    /// Disconnect the tunnel.
    Disconnect,
    /// Pause for the configured default duration.
    Pause,
    /// Resume a paused tunnel.
    Resume,
    /// Force teardown.
    Stop,
    /// Restart the connect flow.
    Reconnect,
}

impl ExternalAction {
    /// Parses an action name, case-insensitively. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "disconnect" => Some(ExternalAction::Disconnect),
            "pause" => Some(ExternalAction::Pause),
            "resume" => Some(ExternalAction::Resume),
            "stop" => Some(ExternalAction::Stop),
            "reconnect" => Some(ExternalAction::Reconnect),
            _ => None,
        }
    }
}

/// Status reported by the tunnel backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    /// The tunnel is established.
    Up,
    /// The tunnel is torn down or failed.
    Down,
}
