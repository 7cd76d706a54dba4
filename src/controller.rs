//! Connection controller.
//!
//! The controller is a single tokio task owning the connection state. Every
//! input (user operations, tunnel status, key events, timer signals, delayed
//! polls, random-server replies and external actions) is a message on one
//! queue, so transitions are applied strictly in arrival order and listener
//! fan-out for one transition completes before the next begins.
//!
//! # Architecture
//!
//! ```text
//!   ControllerHandle ──┐
//!   StatusReporter ────┤
//!   KeyEventReporter ──┤   Input queue   ┌──────────────────────┐
//!   PauseTimer ────────┼───────────────▶ │ ConnectionController │──▶ TunnelBackend
//!   delayed polls ─────┤                 │ (one task)           │──▶ KeyController
//!   random replies ────┘                 └──────────┬───────────┘──▶ NotificationSink
//!   action bus (String) ────────────────────────────┘   │
//!                                                       ▼
//!                                                  ListenerSet
//! ```
//!
//! # State Machine
//!
//! ```text
//!                 connect                    tunnel up
//!   NotConnected ─────────▶ Connecting ──────────────────▶ Connected
//!        ▲  ▲                  │  ▲                           │
//!        │  │ tunnel down      │  │ resume / timer            │ pause
//!        │  └──────────────────┘  │                           ▼
//!        │                       Paused ◀──── tunnel down ── Pausing
//!        │ tunnel down
//!   Disconnecting ◀── disconnect (from Connecting or Connected)
//! ```
//!
//! User actions arriving in `Pausing` or `Disconnecting` are dropped.
//!
//! # Stale Work
//!
//! Connect attempts carry an attempt id. Disconnect, pause and stop start a
//! new id, so a fastest-server poll or random-server reply belonging to an
//! abandoned attempt never starts the tunnel. Timer signals carry the timer
//! generation for the same purpose.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vpnctl::backend::SimulatedBackend;
//! use vpnctl::controller::{Collaborators, ConnectionController, ControllerSettings};
//! use vpnctl::keys::LocalKeyController;
//! use vpnctl::notification::LogNotificationSink;
//! use vpnctl::selection::{fastest_server_cache, StaticServerList};
//! use vpnctl::Config;
//!
//! # async fn example() -> vpnctl::Result<()> {
//! let config = Config::default();
//! let (_publisher, cache) = fastest_server_cache();
//! let handle = ConnectionController::spawn(
//!     ControllerSettings::from_config(&config),
//!     Collaborators {
//!         backend: Arc::new(SimulatedBackend::from_config(&config.backend)),
//!         keys: Arc::new(LocalKeyController::new(&config.keys)),
//!         policy: Arc::new(StaticServerList::from_config(&config, cache)?),
//!         notifications: Arc::new(LogNotificationSink),
//!         actions: None,
//!     },
//! );
//!
//! let mut events = handle.add_state_listener();
//! handle.action_by_user();
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::oneshot;

use crate::backend::{StatusReporter, TunnelBackend};
use crate::config::{Config, LogLevel, SelectionSettings, TimingConfig};
use crate::event::{
    ControllerEvent, ExternalAction, NotificationSignal, RegenerationErrorKind,
    ServerChoiceReason, TunnelStatus,
};
use crate::keys::{KeyController, KeyErrorCode, KeyEvent, KeyEventReporter};
use crate::listeners::{ListenerId, ListenerSet, Subscription};
use crate::logger::plog;
use crate::notification::{format_countdown, NotificationSink};
use crate::selection::{RandomServerReply, ServerSelectionPolicy};
use crate::state::{ConnectionState, Server, ServerRole, ServerSelection};
use crate::timer::{PauseTimer, TimerSignal};

/// Static parameters of a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Initial server-resolution flags.
    pub selection: SelectionSettings,
    /// Timer, poll and retry parameters.
    pub timing: TimingConfig,
    /// Pause duration used by the external `pause` action.
    pub default_pause: Duration,
}

impl ControllerSettings {
    /// Extracts controller settings from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            selection: config.selection,
            timing: config.timing.clone(),
            default_pause: Duration::from_secs(config.default_pause_secs),
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// External components the controller drives.
pub struct Collaborators {
    /// Tunnel implementation.
    pub backend: Arc<dyn TunnelBackend>,
    /// Credential owner.
    pub keys: Arc<dyn KeyController>,
    /// Server resolution.
    pub policy: Arc<dyn ServerSelectionPolicy>,
    /// Presentation layer.
    pub notifications: Arc<dyn NotificationSink>,
    /// Optional bus of named actions (notification buttons, IPC).
    pub actions: Option<UnboundedReceiver<String>>,
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSnapshot {
    /// Current connection state.
    pub state: ConnectionState,
    /// Time left on the pause timer, zero when it is not running.
    pub pause_remaining: Duration,
    /// Servers the next tunnel start would use.
    pub selection: ServerSelection,
    /// Active server-resolution flags.
    pub settings: SelectionSettings,
}

pub(crate) enum Input {
    ActionByUser,
    StartConnecting { force: bool },
    Pause(Duration),
    Resume,
    Disconnect,
    Stop,
    Reconnect,
    RegenerateKeys,
    AddListener(ListenerId, UnboundedSender<ControllerEvent>),
    RemoveListener(ListenerId),
    NotifyState,
    UpdateSettings(SelectionSettings),
    Action(String),
    Snapshot(oneshot::Sender<ControllerSnapshot>),
    Destroy,
    Backend(TunnelStatus),
    Key(KeyEvent),
    Timer(TimerSignal),
    FastestPoll { attempt: u64, polls_left: u32 },
    RandomServer { attempt: u64, role: ServerRole, server: Server },
    RandomTimeout { attempt: u64 },
}

/// Weak posting side of the input queue, held by internal producers.
#[derive(Clone)]
pub(crate) struct Inbox(WeakUnboundedSender<Input>);

impl Inbox {
    fn post(&self, input: Input) {
        if let Some(tx) = self.0.upgrade() {
            let _ = tx.send(input);
        }
    }

    fn post_after(&self, delay: Duration, input: Input) {
        let inbox = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inbox.post(input);
        });
    }
}

struct PendingRandom {
    attempt: u64,
    awaiting: Vec<ServerRole>,
}

enum Next {
    Input(Input),
    Action(Option<String>),
    Closed,
}

/// The connection state machine. Constructed only through
/// [`spawn`](ConnectionController::spawn).
pub struct ConnectionController {
    state: ConnectionState,
    settings: SelectionSettings,
    timing: TimingConfig,
    default_pause: Duration,
    backend: Arc<dyn TunnelBackend>,
    keys: Arc<dyn KeyController>,
    policy: Arc<dyn ServerSelectionPolicy>,
    notifications: Arc<dyn NotificationSink>,
    listeners: ListenerSet,
    timer: PauseTimer,
    inbox: Inbox,
    attempt: u64,
    pending_random: Option<PendingRandom>,
    tunnel_requested: bool,
    pending_downs: u32,
    waiting_for_keys: bool,
    key_failures: u32,
}

impl ConnectionController {
    /// Spawns the controller task and returns a handle to it.
    ///
    /// Attaches status and key reporters to the collaborators. The task runs
    /// until [`ControllerHandle::destroy`] or until every handle is dropped.
    /// Must be called from within a tokio runtime.
    pub fn spawn(settings: ControllerSettings, collaborators: Collaborators) -> ControllerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let inbox = Inbox(tx.downgrade());

        let status_inbox = inbox.clone();
        let reporter = StatusReporter::new(move |status| status_inbox.post(Input::Backend(status)));
        collaborators.backend.attach(reporter);
        let key_inbox = inbox.clone();
        let reporter = KeyEventReporter::new(move |event| key_inbox.post(Input::Key(event)));
        collaborators.keys.attach(reporter);
        let timer_inbox = inbox.clone();
        let timer = PauseTimer::new(
            Duration::from_millis(settings.timing.timer_tick_ms),
            Arc::new(move |signal| timer_inbox.post(Input::Timer(signal))),
        );

        let controller = ConnectionController {
            state: ConnectionState::NotConnected,
            settings: settings.selection,
            timing: settings.timing,
            default_pause: settings.default_pause,
            backend: collaborators.backend,
            keys: collaborators.keys,
            policy: collaborators.policy,
            notifications: collaborators.notifications,
            listeners: ListenerSet::new(),
            timer,
            inbox,
            attempt: 0,
            pending_random: None,
            tunnel_requested: false,
            pending_downs: 0,
            waiting_for_keys: false,
            key_failures: 0,
        };
        plog(LogLevel::Info, "Connection controller created");
        tokio::spawn(controller.run(rx, collaborators.actions));

        ControllerHandle {
            tx,
            next_listener: Arc::new(AtomicU64::new(1)),
        }
    }

    async fn run(
        mut self,
        mut rx: UnboundedReceiver<Input>,
        mut actions: Option<UnboundedReceiver<String>>,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                input = rx.recv() => input.map_or(Next::Closed, Next::Input),
                action = next_action(&mut actions) => Next::Action(action),
            };
            match next {
                Next::Input(Input::Destroy) | Next::Closed => break,
                Next::Input(input) => self.handle(input),
                Next::Action(Some(name)) => self.on_external_action(&name),
                Next::Action(None) => {
                    plog(LogLevel::Debug, "Action bus closed");
                    actions = None;
                }
            }
        }
        drop(actions);
        self.destroy();
    }

    fn handle(&mut self, input: Input) {
        match input {
            Input::ActionByUser => self.action_by_user(),
            Input::StartConnecting { force } => self.start_connecting(force),
            Input::Pause(duration) => self.pause(duration),
            Input::Resume => self.resume(),
            Input::Disconnect => self.disconnect(),
            Input::Stop => self.stop(),
            Input::Reconnect => self.reconnect(),
            Input::RegenerateKeys => {
                plog(LogLevel::Info, "Regenerating keys on request");
                self.keys.regenerate();
            }
            Input::AddListener(id, tx) => {
                plog(LogLevel::Debug, &format!("Adding {}", id));
                self.listeners
                    .add(id, tx, ControllerEvent::StateChanged(self.state));
            }
            Input::RemoveListener(id) => {
                if !self.listeners.remove(id) {
                    plog(LogLevel::Debug, &format!("{} was not registered", id));
                }
            }
            Input::NotifyState => self.notify_state(),
            Input::UpdateSettings(settings) => {
                plog(LogLevel::Info, &format!("Selection settings updated: {:?}", settings));
                self.settings = settings;
            }
            Input::Action(name) => self.on_external_action(&name),
            Input::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Input::Destroy => {}
            Input::Backend(status) => self.on_tunnel_status(status),
            Input::Key(event) => self.on_key_event(event),
            Input::Timer(signal) => self.on_timer(signal),
            Input::FastestPoll {
                attempt,
                polls_left,
            } => self.on_fastest_poll(attempt, polls_left),
            Input::RandomServer {
                attempt,
                role,
                server,
            } => self.on_random_server(attempt, role, server),
            Input::RandomTimeout { attempt } => self.on_random_timeout(attempt),
        }
    }

    // ---- public operations ----

    fn action_by_user(&mut self) {
        plog(LogLevel::Info, &format!("User action, state = {}", self.state));
        if self.state.is_transient() {
            plog(LogLevel::Debug, "Ignoring user action during transition");
        } else if self.state.is_live() {
            self.start_disconnect();
        } else {
            self.start_connecting(false);
        }
    }

    fn start_connecting(&mut self, force: bool) {
        plog(
            LogLevel::Info,
            &format!("Start connecting, state = {}, force = {}", self.state, force),
        );
        if !force && self.keys.is_expired() {
            plog(LogLevel::Info, "Keys expired, regenerating before connect");
            self.waiting_for_keys = true;
            self.keys.regenerate();
            return;
        }

        let attempt = self.new_attempt();
        self.timer.stop();
        self.set_state(ConnectionState::Connecting);

        if self.settings.fastest_server && !self.settings.multihop {
            self.find_fastest_server(attempt);
        } else {
            self.resolve_random_servers(attempt);
        }
    }

    fn pause(&mut self, duration: Duration) {
        plog(
            LogLevel::Info,
            &format!("Pause for {}, state = {}", format_countdown(duration), self.state),
        );
        if duration.is_zero() {
            plog(LogLevel::Warn, "Ignoring pause with zero duration");
            return;
        }
        if !self.state.is_live() {
            plog(LogLevel::Debug, &format!("Ignoring pause in {}", self.state));
            return;
        }

        self.new_attempt();
        self.timer.start(duration);
        let was_running = self.tunnel_requested;
        self.set_state(ConnectionState::Pausing);
        self.stop_tunnel();
        if !was_running {
            self.set_state(ConnectionState::Paused);
        }
    }

    fn resume(&mut self) {
        plog(LogLevel::Info, &format!("Resume, state = {}", self.state));
        if self.state.is_transient() {
            plog(LogLevel::Debug, "Ignoring resume during transition");
            return;
        }
        self.timer.stop();
        if self.state.is_idle() {
            self.new_attempt();
            self.set_state(ConnectionState::Connecting);
            self.start_tunnel();
        }
    }

    fn disconnect(&mut self) {
        plog(LogLevel::Info, &format!("Disconnect, state = {}", self.state));
        if self.state.is_transient() {
            plog(LogLevel::Debug, "Ignoring disconnect during transition");
            return;
        }
        match self.state {
            ConnectionState::Paused => {
                self.timer.stop();
                self.new_attempt();
                self.stop_tunnel();
                self.set_state(ConnectionState::NotConnected);
            }
            ConnectionState::NotConnected => self.stop_tunnel(),
            _ => self.start_disconnect(),
        }
    }

    fn stop(&mut self) {
        plog(LogLevel::Info, &format!("Stop, state = {}", self.state));
        self.timer.stop();
        self.new_attempt();
        self.stop_tunnel();
        self.set_state(ConnectionState::NotConnected);
    }

    fn reconnect(&mut self) {
        plog(LogLevel::Info, &format!("Reconnect, state = {}", self.state));
        self.timer.stop();
        self.new_attempt();
        self.stop_tunnel();
        self.set_state(ConnectionState::Connecting);
        self.start_connecting(false);
    }

    fn notify_state(&mut self) {
        self.emit(ControllerEvent::StateChanged(self.state));
        if self.timer.is_running() {
            self.emit(ControllerEvent::TimerTick {
                remaining: self.timer.remaining(),
            });
        }
    }

    fn on_external_action(&mut self, name: &str) {
        let Some(action) = ExternalAction::parse(name) else {
            plog(LogLevel::Debug, &format!("Ignoring unknown action {:?}", name));
            return;
        };
        plog(LogLevel::Info, &format!("External action {:?}", action));
        match action {
            ExternalAction::Disconnect => self.disconnect(),
            ExternalAction::Pause => self.pause(self.default_pause),
            ExternalAction::Resume => self.resume(),
            ExternalAction::Stop => self.stop(),
            ExternalAction::Reconnect => self.reconnect(),
        }
    }

    fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            state: self.state,
            pause_remaining: self.timer.remaining(),
            selection: self.current_selection(),
            settings: self.settings,
        }
    }

    fn destroy(&mut self) {
        plog(LogLevel::Info, "Destroying controller");
        self.backend.detach();
        self.keys.detach();
        self.stop();
        self.listeners.clear();
    }

    // ---- server resolution ----

    fn find_fastest_server(&mut self, attempt: u64) {
        self.emit(ControllerEvent::FindingFastestServer);
        match self.policy.fastest_cached() {
            Some(server) => self.use_fastest_server(server),
            None => {
                plog(LogLevel::Info, "No fastest server cached yet, polling");
                self.inbox.post_after(
                    Duration::from_millis(self.timing.fastest_poll_ms),
                    Input::FastestPoll {
                        attempt,
                        polls_left: self.timing.fastest_poll_attempts.max(1),
                    },
                );
            }
        }
    }

    fn on_fastest_poll(&mut self, attempt: u64, polls_left: u32) {
        if !self.is_current_attempt(attempt) {
            plog(LogLevel::Debug, "Dropping stale fastest-server poll");
            return;
        }
        if let Some(server) = self.policy.fastest_cached() {
            self.use_fastest_server(server);
        } else if polls_left > 1 {
            self.inbox.post_after(
                Duration::from_millis(self.timing.fastest_poll_ms),
                Input::FastestPoll {
                    attempt,
                    polls_left: polls_left - 1,
                },
            );
        } else {
            plog(LogLevel::Info, "Fastest server unavailable, using default");
            let server = self.policy.default_server(ServerRole::Entry);
            self.use_fastest_server(server);
        }
    }

    fn use_fastest_server(&mut self, server: Server) {
        plog(LogLevel::Info, &format!("Fastest server is {}", server));
        self.emit(ControllerEvent::ServerChosen {
            server: server.clone(),
            role: ServerRole::Entry,
            reason: ServerChoiceReason::Fastest,
        });
        self.policy.set_current(ServerRole::Entry, server);
        self.start_tunnel();
    }

    fn resolve_random_servers(&mut self, attempt: u64) {
        let mut awaiting = Vec::new();
        if self.settings.random_entry {
            awaiting.push(ServerRole::Entry);
        }
        if self.settings.random_exit {
            awaiting.push(ServerRole::Exit);
        }
        if awaiting.is_empty() {
            self.start_tunnel();
            return;
        }

        self.pending_random = Some(PendingRandom {
            attempt,
            awaiting: awaiting.clone(),
        });
        for role in awaiting {
            let inbox = self.inbox.clone();
            self.policy.request_random(
                role,
                RandomServerReply::new(move |server| {
                    inbox.post(Input::RandomServer {
                        attempt,
                        role,
                        server,
                    })
                }),
            );
        }
        self.inbox.post_after(
            Duration::from_millis(self.timing.random_selection_timeout_ms),
            Input::RandomTimeout { attempt },
        );
    }

    fn on_random_server(&mut self, attempt: u64, role: ServerRole, server: Server) {
        let current = self.is_current_attempt(attempt);
        let Some(pending) = self
            .pending_random
            .as_mut()
            .filter(|pending| current && pending.attempt == attempt)
        else {
            plog(LogLevel::Debug, "Dropping stale random server");
            return;
        };
        let Some(index) = pending.awaiting.iter().position(|r| *r == role) else {
            plog(LogLevel::Debug, &format!("Dropping duplicate random {} server", role));
            return;
        };
        pending.awaiting.remove(index);
        let done = pending.awaiting.is_empty();

        plog(LogLevel::Info, &format!("Random {} server is {}", role, server));
        self.emit(ControllerEvent::ServerChosen {
            server: server.clone(),
            role,
            reason: ServerChoiceReason::Random,
        });
        self.policy.set_current(role, server);

        if done {
            self.pending_random = None;
            self.start_tunnel();
        }
    }

    fn on_random_timeout(&mut self, attempt: u64) {
        let matches = self
            .pending_random
            .as_ref()
            .is_some_and(|pending| pending.attempt == attempt);
        if !matches || !self.is_current_attempt(attempt) {
            return;
        }
        plog(
            LogLevel::Warn,
            "Random server selection timed out, using current servers",
        );
        self.pending_random = None;
        self.start_tunnel();
    }

    fn current_selection(&self) -> ServerSelection {
        let server = |role| {
            self.policy
                .current(role)
                .unwrap_or_else(|| self.policy.default_server(role))
        };
        ServerSelection {
            entry: Some(server(ServerRole::Entry)),
            exit: self.settings.multihop.then(|| server(ServerRole::Exit)),
        }
    }

    // ---- collaborator callbacks ----

    fn on_tunnel_status(&mut self, status: TunnelStatus) {
        plog(
            LogLevel::Info,
            &format!("Tunnel reported {:?}, state = {}", status, self.state),
        );
        match status {
            TunnelStatus::Up => match self.state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    self.pending_downs = 0;
                    self.key_failures = 0;
                    self.set_state(ConnectionState::Connected);
                }
                _ => plog(LogLevel::Debug, &format!("Ignoring tunnel up in {}", self.state)),
            },
            TunnelStatus::Down => {
                if self.pending_downs > 0 {
                    self.pending_downs -= 1;
                    if self.state == ConnectionState::Connecting {
                        plog(LogLevel::Debug, "Absorbed teardown of the previous tunnel");
                        return;
                    }
                }
                self.tunnel_requested = false;
                match self.state {
                    ConnectionState::Pausing => {
                        self.set_state(ConnectionState::Paused);
                        if !self.timer.is_running() {
                            self.resume();
                        }
                    }
                    ConnectionState::Connecting => {
                        self.new_attempt();
                        self.set_state(ConnectionState::NotConnected);
                    }
                    _ => self.set_state(ConnectionState::NotConnected),
                }
                self.emit(ControllerEvent::CheckSession);
            }
        }
    }

    fn on_key_event(&mut self, event: KeyEvent) {
        match event {
            KeyEvent::Generating => self.emit(ControllerEvent::KeyRegenerating),
            KeyEvent::Generated => {
                plog(LogLevel::Info, &format!("Keys regenerated, state = {}", self.state));
                self.waiting_for_keys = false;
                self.key_failures = 0;
                self.emit(ControllerEvent::KeyRegenerated);
                if self.state.is_transient() {
                    plog(LogLevel::Debug, "Ignoring key regeneration during transition");
                } else if self.state.is_idle() {
                    self.start_connecting(false);
                } else {
                    self.reconnect();
                }
            }
            KeyEvent::Failed { code, cause } => self.on_key_failure(code, &cause),
        }
    }

    fn on_key_failure(&mut self, code: KeyErrorCode, cause: &str) {
        plog(
            LogLevel::Info,
            &format!(
                "Key regeneration failed ({}: {}), state = {}",
                code, cause, self.state
            ),
        );
        let awaiting_keys = self.state.is_idle()
            || (self.state == ConnectionState::Connecting && self.waiting_for_keys);
        self.waiting_for_keys = false;

        if !awaiting_keys {
            if self.state.is_live() && self.keys.is_hard_expired() {
                self.report_key_error(RegenerationErrorKind::UpgradeRequired);
            }
            return;
        }

        let fatal = match code {
            KeyErrorCode::KeyNotFound => Some(RegenerationErrorKind::UpgradeRequired),
            KeyErrorCode::KeyLimitReached => Some(RegenerationErrorKind::MaximumKeysReached),
            KeyErrorCode::Other(_) if self.keys.is_hard_expired() => {
                Some(RegenerationErrorKind::UpgradeRequired)
            }
            KeyErrorCode::Other(_) => None,
        };
        if let Some(kind) = fatal {
            self.abandon_attempt(kind);
            return;
        }

        self.key_failures += 1;
        if self.key_failures > self.timing.key_retry_limit {
            self.key_failures = 0;
            self.abandon_attempt(RegenerationErrorKind::RetriesExhausted);
            return;
        }
        self.keys.start_short_retry_alarm();
        self.start_connecting(true);
    }

    fn abandon_attempt(&mut self, kind: RegenerationErrorKind) {
        self.report_key_error(kind);
        if self.state == ConnectionState::Connecting {
            self.new_attempt();
            self.set_state(ConnectionState::NotConnected);
        }
    }

    fn report_key_error(&mut self, kind: RegenerationErrorKind) {
        plog(LogLevel::Warn, &format!("Key regeneration error: {}", kind));
        self.emit(ControllerEvent::KeyRegenerationError(kind));
    }

    fn on_timer(&mut self, signal: TimerSignal) {
        if !self.timer.is_current(signal.generation()) {
            plog(LogLevel::Debug, "Dropping stale timer signal");
            return;
        }
        match signal {
            TimerSignal::Tick { remaining, .. } => {
                plog(
                    LogLevel::Info,
                    &format!("Will resume in {}", format_countdown(remaining)),
                );
                self.emit(ControllerEvent::TimerTick { remaining });
            }
            TimerSignal::Finished { generation } => {
                self.timer.complete(generation);
                plog(LogLevel::Info, "Pause elapsed");
                if self.state.is_idle() {
                    self.resume();
                }
                self.emit(ControllerEvent::TimerFinished);
            }
        }
    }

    // ---- helpers ----

    fn start_disconnect(&mut self) {
        self.new_attempt();
        let was_running = self.tunnel_requested;
        self.set_state(ConnectionState::Disconnecting);
        self.stop_tunnel();
        if !was_running {
            self.set_state(ConnectionState::NotConnected);
        }
    }

    fn start_tunnel(&mut self) {
        let selection = self.current_selection();
        plog(LogLevel::Info, &format!("Starting tunnel via {}", selection));
        self.tunnel_requested = true;
        self.backend.start(&selection);
    }

    fn stop_tunnel(&mut self) {
        if self.tunnel_requested {
            self.tunnel_requested = false;
            self.pending_downs += 1;
        }
        self.backend.stop();
    }

    fn new_attempt(&mut self) -> u64 {
        self.attempt += 1;
        self.pending_random = None;
        self.waiting_for_keys = false;
        self.attempt
    }

    fn is_current_attempt(&self, attempt: u64) -> bool {
        attempt == self.attempt && self.state == ConnectionState::Connecting
    }

    fn set_state(&mut self, state: ConnectionState) {
        if state == self.state {
            return;
        }
        plog(LogLevel::Info, &format!("State {} -> {}", self.state, state));
        self.state = state;
        self.emit(ControllerEvent::StateChanged(state));
        if let Some(signal) = NotificationSignal::for_state(state, self.timer.remaining()) {
            self.notifications.signal(signal);
        }
    }

    fn emit(&mut self, event: ControllerEvent) {
        self.listeners.dispatch(&event);
    }
}

async fn next_action(actions: &mut Option<UnboundedReceiver<String>>) -> Option<String> {
    match actions {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Cloneable handle to a running [`ConnectionController`].
///
/// Every operation is queued to the controller task and returns immediately.
/// Operations on a controller that has shut down are logged and dropped.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: UnboundedSender<Input>,
    next_listener: Arc<AtomicU64>,
}

impl ControllerHandle {
    /// Toggles the connection: connect when idle, disconnect when live, and
    /// nothing mid-transition.
    pub fn action_by_user(&self) {
        self.send(Input::ActionByUser);
    }

    /// Starts the connect flow. Unless `force` is set, expired keys are
    /// regenerated first and the flow resumes once that succeeds.
    pub fn start_connecting(&self, force: bool) {
        self.send(Input::StartConnecting { force });
    }

    /// Pauses a live connection for `duration`, then resumes automatically.
    pub fn pause(&self, duration: Duration) {
        self.send(Input::Pause(duration));
    }

    /// Cancels the pause timer and reconnects.
    pub fn resume(&self) {
        self.send(Input::Resume);
    }

    /// Disconnects a live connection, or stops the backend when idle.
    pub fn disconnect(&self) {
        self.send(Input::Disconnect);
    }

    /// Tears everything down and forces `NotConnected`.
    pub fn stop(&self) {
        self.send(Input::Stop);
    }

    /// Forces `Connecting` and restarts the connect flow.
    pub fn reconnect(&self) {
        self.send(Input::Reconnect);
    }

    /// Asks the key controller to regenerate keys.
    pub fn regenerate_keys(&self) {
        self.send(Input::RegenerateKeys);
    }

    /// Registers a listener. Its first event is the current state.
    pub fn add_state_listener(&self) -> Subscription {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let (tx, subscription) = Subscription::channel(id);
        self.send(Input::AddListener(id, tx));
        subscription
    }

    /// Unregisters a listener.
    pub fn remove_state_listener(&self, id: ListenerId) {
        self.send(Input::RemoveListener(id));
    }

    /// Re-emits the current state, plus the remaining pause time while the
    /// timer runs.
    pub fn notify_vpn_state(&self) {
        self.send(Input::NotifyState);
    }

    /// Replaces the server-resolution flags used by later connect attempts.
    pub fn update_settings(&self, settings: SelectionSettings) {
        self.send(Input::UpdateSettings(settings));
    }

    /// Delivers a named external action. Unknown names are ignored.
    pub fn deliver_action(&self, name: &str) {
        self.send(Input::Action(name.to_string()));
    }

    /// Returns the controller's view after every previously queued input is
    /// processed, or `None` if it has shut down.
    pub async fn snapshot(&self) -> Option<ControllerSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Input::Snapshot(reply));
        rx.await.ok()
    }

    /// Releases all registrations, stops the tunnel and clears listeners.
    pub fn destroy(&self) {
        self.send(Input::Destroy);
    }

    /// Waits until the controller task has shut down.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    fn send(&self, input: Input) {
        if self.tx.send(input).is_err() {
            plog(LogLevel::Debug, "Controller has shut down, dropping request");
        }
    }
}

impl std::fmt::Debug for ControllerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::{fastest_server_cache, FastestServerPublisher, StaticServerList};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockBackend {
        reporter: Mutex<Option<StatusReporter>>,
        starts: Mutex<Vec<ServerSelection>>,
        stops: AtomicUsize,
        detached: AtomicBool,
    }

    impl MockBackend {
        fn report(&self, status: TunnelStatus) {
            let reporter = self.reporter.lock().unwrap().clone();
            reporter.expect("backend attached").report(status);
        }

        fn starts(&self) -> Vec<ServerSelection> {
            self.starts.lock().unwrap().clone()
        }

        fn stops(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    impl TunnelBackend for MockBackend {
        fn attach(&self, reporter: StatusReporter) {
            *self.reporter.lock().unwrap() = Some(reporter);
        }

        fn detach(&self) {
            self.detached.store(true, Ordering::SeqCst);
            *self.reporter.lock().unwrap() = None;
        }

        fn start(&self, selection: &ServerSelection) {
            self.starts.lock().unwrap().push(selection.clone());
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockKeys {
        reporter: Mutex<Option<KeyEventReporter>>,
        expired: AtomicBool,
        hard_expired: AtomicBool,
        regenerations: AtomicUsize,
        alarms: AtomicUsize,
        detached: AtomicBool,
    }

    impl MockKeys {
        fn reporter(&self) -> KeyEventReporter {
            self.reporter.lock().unwrap().clone().expect("keys attached")
        }

        fn set_expired(&self, soft: bool, hard: bool) {
            self.expired.store(soft, Ordering::SeqCst);
            self.hard_expired.store(hard, Ordering::SeqCst);
        }

        fn regenerations(&self) -> usize {
            self.regenerations.load(Ordering::SeqCst)
        }

        fn alarms(&self) -> usize {
            self.alarms.load(Ordering::SeqCst)
        }
    }

    impl KeyController for MockKeys {
        fn attach(&self, reporter: KeyEventReporter) {
            *self.reporter.lock().unwrap() = Some(reporter);
        }

        fn detach(&self) {
            self.detached.store(true, Ordering::SeqCst);
        }

        fn is_expired(&self) -> bool {
            self.expired.load(Ordering::SeqCst)
        }

        fn is_hard_expired(&self) -> bool {
            self.hard_expired.load(Ordering::SeqCst)
        }

        fn regenerate(&self) {
            self.regenerations.fetch_add(1, Ordering::SeqCst);
        }

        fn start_short_retry_alarm(&self) {
            self.alarms.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        signals: Mutex<Vec<NotificationSignal>>,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<NotificationSignal> {
            std::mem::take(&mut *self.signals.lock().unwrap())
        }
    }

    impl NotificationSink for RecordingSink {
        fn signal(&self, signal: NotificationSignal) {
            self.signals.lock().unwrap().push(signal);
        }
    }

    /// Policy whose random replies never arrive.
    struct SilentRandomPolicy(StaticServerList);

    impl ServerSelectionPolicy for SilentRandomPolicy {
        fn fastest_cached(&self) -> Option<Server> {
            self.0.fastest_cached()
        }

        fn default_server(&self, role: ServerRole) -> Server {
            self.0.default_server(role)
        }

        fn request_random(&self, _role: ServerRole, reply: RandomServerReply) {
            drop(reply);
        }

        fn set_current(&self, role: ServerRole, server: Server) {
            self.0.set_current(role, server)
        }

        fn current(&self, role: ServerRole) -> Option<Server> {
            self.0.current(role)
        }
    }

    struct Harness {
        handle: ControllerHandle,
        backend: Arc<MockBackend>,
        keys: Arc<MockKeys>,
        sink: Arc<RecordingSink>,
        publisher: FastestServerPublisher,
        actions: UnboundedSender<String>,
        events: Subscription,
    }

    fn servers() -> Vec<Server> {
        vec![
            Server::new("s0", "Server 0", "10.0.0.1:51820"),
            Server::new("s1", "Server 1", "10.0.0.2:51820"),
            Server::new("s2", "Server 2", "10.0.0.3:51820"),
        ]
    }

    /// Lets every runnable task finish, advancing virtual time by 1ms.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn states(events: &[ControllerEvent]) -> Vec<ConnectionState> {
        events.iter().filter_map(ControllerEvent::state).collect()
    }

    fn ticks(events: &[ControllerEvent]) -> Vec<Duration> {
        events
            .iter()
            .filter_map(|e| match e {
                ControllerEvent::TimerTick { remaining } => Some(*remaining),
                _ => None,
            })
            .collect()
    }

    async fn harness(selection: SelectionSettings) -> Harness {
        harness_with(selection, false).await
    }

    async fn harness_with(selection: SelectionSettings, silent_random: bool) -> Harness {
        let backend = Arc::new(MockBackend::default());
        let keys = Arc::new(MockKeys::default());
        let sink = Arc::new(RecordingSink::default());
        let (publisher, cache) = fastest_server_cache();
        let list = StaticServerList::new(servers(), cache).unwrap();
        let policy: Arc<dyn ServerSelectionPolicy> = if silent_random {
            Arc::new(SilentRandomPolicy(list))
        } else {
            Arc::new(list)
        };
        let (actions, actions_rx) = mpsc::unbounded_channel();

        let settings = ControllerSettings {
            selection,
            timing: TimingConfig::default(),
            default_pause: Duration::from_secs(60),
        };
        let handle = ConnectionController::spawn(
            settings,
            Collaborators {
                backend: backend.clone(),
                keys: keys.clone(),
                policy,
                notifications: sink.clone(),
                actions: Some(actions_rx),
            },
        );
        let mut events = handle.add_state_listener();
        settle().await;
        assert_eq!(
            events.drain(),
            vec![ControllerEvent::StateChanged(ConnectionState::NotConnected)]
        );

        Harness {
            handle,
            backend,
            keys,
            sink,
            publisher,
            actions,
            events,
        }
    }

    impl Harness {
        async fn state(&self) -> ConnectionState {
            self.handle.snapshot().await.unwrap().state
        }

        async fn connect(&mut self) {
            self.handle.action_by_user();
            settle().await;
            self.backend.report(TunnelStatus::Up);
            settle().await;
            assert_eq!(self.state().await, ConnectionState::Connected);
            self.events.drain();
            self.sink.take();
        }

        async fn pause_until_paused(&mut self, duration: Duration) {
            self.handle.pause(duration);
            settle().await;
            self.backend.report(TunnelStatus::Down);
            settle().await;
            assert_eq!(self.state().await, ConnectionState::Paused);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_emits_connecting_then_connected() {
        let mut h = harness(SelectionSettings::default()).await;

        h.handle.action_by_user();
        settle().await;
        assert_eq!(states(&h.events.drain()), vec![ConnectionState::Connecting]);
        let starts = h.backend.starts();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].entry.as_ref().unwrap().id, "s0");
        assert!(starts[0].exit.is_none());

        h.backend.report(TunnelStatus::Up);
        settle().await;
        assert_eq!(states(&h.events.drain()), vec![ConnectionState::Connected]);
        assert_eq!(
            h.sink.take(),
            vec![NotificationSignal::Connecting, NotificationSignal::Connected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_from_paused_cancels_timer() {
        let mut h = harness(SelectionSettings::default()).await;
        h.connect().await;
        h.pause_until_paused(Duration::from_secs(5)).await;
        h.events.drain();

        h.handle.action_by_user();
        settle().await;
        h.backend.report(TunnelStatus::Up);
        settle().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        let events = h.events.drain();
        assert_eq!(
            states(&events),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert!(!events.contains(&ControllerEvent::TimerFinished));
        assert_eq!(h.backend.starts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_action_ignored_while_disconnecting() {
        let mut h = harness(SelectionSettings::default()).await;
        h.connect().await;

        h.handle.action_by_user();
        settle().await;
        assert_eq!(states(&h.events.drain()), vec![ConnectionState::Disconnecting]);

        h.handle.action_by_user();
        h.handle.action_by_user();
        h.handle.disconnect();
        settle().await;
        assert!(h.events.drain().is_empty());
        assert_eq!(h.state().await, ConnectionState::Disconnecting);
        assert_eq!(h.backend.stops(), 1);

        h.backend.report(TunnelStatus::Down);
        settle().await;
        assert_eq!(
            h.events.drain(),
            vec![
                ControllerEvent::StateChanged(ConnectionState::NotConnected),
                ControllerEvent::CheckSession,
            ]
        );
        assert_eq!(h.sink.take(), vec![NotificationSignal::Disconnected]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_action_ignored_while_pausing() {
        let mut h = harness(SelectionSettings::default()).await;
        h.connect().await;

        h.handle.pause(Duration::from_secs(30));
        settle().await;
        h.events.drain();

        h.handle.action_by_user();
        h.handle.resume();
        settle().await;
        assert!(states(&h.events.drain()).is_empty());
        assert_eq!(h.state().await, ConnectionState::Pausing);
        assert_eq!(h.backend.starts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_sequence_and_ticks() {
        let mut h = harness(SelectionSettings::default()).await;
        h.connect().await;

        h.handle.pause(Duration::from_secs(5));
        settle().await;
        assert_eq!(states(&h.events.drain()), vec![ConnectionState::Pausing]);
        assert_eq!(h.backend.stops(), 1);

        h.backend.report(TunnelStatus::Down);
        settle().await;
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let events = h.events.drain();
        assert_eq!(states(&events), vec![ConnectionState::Paused]);
        assert!(events.contains(&ControllerEvent::CheckSession));
        let remaining = ticks(&events);
        assert_eq!(remaining.len(), 2);
        assert!(remaining.windows(2).all(|w| w[0] > w[1]));
        assert!(matches!(
            h.sink.take().as_slice(),
            [NotificationSignal::Paused { .. }]
        ));

        h.handle.resume();
        tokio::time::sleep(Duration::from_secs(5)).await;
        let events = h.events.drain();
        assert_eq!(states(&events), vec![ConnectionState::Connecting]);
        assert!(ticks(&events).is_empty());
        assert!(!events.contains(&ControllerEvent::TimerFinished));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_completion_auto_resumes() {
        let mut h = harness(SelectionSettings::default()).await;
        h.connect().await;
        h.pause_until_paused(Duration::from_secs(3)).await;
        h.events.drain();

        tokio::time::sleep(Duration::from_millis(3500)).await;

        let events: Vec<_> = h
            .events
            .drain()
            .into_iter()
            .filter(|e| !matches!(e, ControllerEvent::TimerTick { .. }))
            .collect();
        assert_eq!(
            events,
            vec![
                ControllerEvent::StateChanged(ConnectionState::Connecting),
                ControllerEvent::TimerFinished,
            ]
        );
        assert_eq!(h.backend.starts().len(), 2);
        assert_eq!(h.handle.snapshot().await.unwrap().pause_remaining, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_pause_and_idle_pause_rejected() {
        let mut h = harness(SelectionSettings::default()).await;
        h.handle.pause(Duration::from_secs(10));
        settle().await;
        assert!(h.events.drain().is_empty());

        h.connect().await;
        h.handle.pause(Duration::ZERO);
        settle().await;
        assert!(h.events.drain().is_empty());
        assert_eq!(h.state().await, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_from_paused() {
        let mut h = harness(SelectionSettings::default()).await;
        h.connect().await;
        h.pause_until_paused(Duration::from_secs(5)).await;
        h.events.drain();

        h.handle.disconnect();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let events = h.events.drain();
        assert_eq!(states(&events), vec![ConnectionState::NotConnected]);
        assert!(!events.contains(&ControllerEvent::TimerFinished));
        assert_eq!(h.handle.snapshot().await.unwrap().pause_remaining, Duration::ZERO);
        assert_eq!(h.backend.starts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_when_idle_stops_backend_only() {
        let mut h = harness(SelectionSettings::default()).await;
        h.handle.disconnect();
        settle().await;
        assert!(h.events.drain().is_empty());
        assert_eq!(h.backend.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_expiry_while_idle_reports_once() {
        let mut h = harness(SelectionSettings::default()).await;
        h.keys.set_expired(true, true);

        h.handle.action_by_user();
        settle().await;
        assert_eq!(h.keys.regenerations(), 1);
        assert!(h.events.drain().is_empty());

        h.keys.reporter().failed(KeyErrorCode::Other(Some(500)), "server error");
        settle().await;

        assert_eq!(
            h.events.drain(),
            vec![ControllerEvent::KeyRegenerationError(
                RegenerationErrorKind::UpgradeRequired
            )]
        );
        assert_eq!(h.state().await, ConnectionState::NotConnected);
        assert!(h.backend.starts().is_empty());
        assert_eq!(h.keys.alarms(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_error_codes_map_to_dialogs() {
        let mut h = harness(SelectionSettings::default()).await;

        h.keys.reporter().failed(KeyErrorCode::KeyNotFound, "unknown key");
        h.keys
            .reporter()
            .failed(KeyErrorCode::from_status(Some(423)), "too many keys");
        settle().await;

        assert_eq!(
            h.events.drain(),
            vec![
                ControllerEvent::KeyRegenerationError(RegenerationErrorKind::UpgradeRequired),
                ControllerEvent::KeyRegenerationError(RegenerationErrorKind::MaximumKeysReached),
            ]
        );
        assert!(h.backend.starts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_key_error_retries_and_forces_connect() {
        let mut h = harness(SelectionSettings::default()).await;
        h.keys.set_expired(true, false);

        h.handle.action_by_user();
        settle().await;
        h.keys.reporter().failed(KeyErrorCode::Other(Some(503)), "unavailable");
        settle().await;

        assert_eq!(h.keys.alarms(), 1);
        assert_eq!(h.keys.regenerations(), 1);
        assert_eq!(states(&h.events.drain()), vec![ConnectionState::Connecting]);
        assert_eq!(h.backend.starts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_key_errors_are_bounded() {
        let mut h = harness(SelectionSettings::default()).await;
        h.keys.set_expired(true, false);

        for _ in 0..3 {
            h.keys.reporter().failed(KeyErrorCode::Other(None), "timeout");
            settle().await;
            assert_eq!(h.state().await, ConnectionState::Connecting);
            h.backend.report(TunnelStatus::Down);
            settle().await;
        }
        h.events.drain();

        h.keys.reporter().failed(KeyErrorCode::Other(None), "timeout");
        settle().await;

        assert_eq!(
            h.events.drain(),
            vec![ControllerEvent::KeyRegenerationError(
                RegenerationErrorKind::RetriesExhausted
            )]
        );
        assert_eq!(h.keys.alarms(), 3);
        assert_eq!(h.state().await, ConnectionState::NotConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_error_while_live_only_reports_hard_expiry() {
        let mut h = harness(SelectionSettings::default()).await;
        h.connect().await;

        h.keys.reporter().failed(KeyErrorCode::Other(None), "soft");
        settle().await;
        assert!(h.events.drain().is_empty());

        h.keys.set_expired(true, true);
        h.keys.reporter().failed(KeyErrorCode::Other(None), "hard");
        settle().await;
        assert_eq!(
            h.events.drain(),
            vec![ControllerEvent::KeyRegenerationError(
                RegenerationErrorKind::UpgradeRequired
            )]
        );
        assert_eq!(h.state().await, ConnectionState::Connected);
        assert_eq!(h.keys.alarms(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_regeneration_success_when_idle_connects() {
        let mut h = harness(SelectionSettings::default()).await;
        h.keys.set_expired(true, false);

        h.handle.action_by_user();
        settle().await;
        h.keys.set_expired(false, false);
        h.keys.reporter().generating();
        h.keys.reporter().generated();
        settle().await;

        assert_eq!(
            h.events.drain(),
            vec![
                ControllerEvent::KeyRegenerating,
                ControllerEvent::KeyRegenerated,
                ControllerEvent::StateChanged(ConnectionState::Connecting),
            ]
        );
        assert_eq!(h.backend.starts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_regeneration_success_when_connected_reconnects() {
        let mut h = harness(SelectionSettings::default()).await;
        h.connect().await;

        h.keys.reporter().generated();
        settle().await;
        assert_eq!(h.backend.stops(), 1);
        assert_eq!(h.backend.starts().len(), 2);
        assert_eq!(states(&h.events.drain()), vec![ConnectionState::Connecting]);

        h.backend.report(TunnelStatus::Down);
        settle().await;
        assert!(h.events.drain().is_empty());

        h.backend.report(TunnelStatus::Up);
        settle().await;
        assert_eq!(states(&h.events.drain()), vec![ConnectionState::Connected]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_regeneration_success_ignored_while_pausing() {
        let mut h = harness(SelectionSettings::default()).await;
        h.connect().await;
        h.handle.pause(Duration::from_secs(30));
        settle().await;
        h.events.drain();

        h.keys.reporter().generated();
        settle().await;

        let events: Vec<_> = h
            .events
            .drain()
            .into_iter()
            .filter(|e| !matches!(e, ControllerEvent::TimerTick { .. }))
            .collect();
        assert_eq!(events, vec![ControllerEvent::KeyRegenerated]);
        assert_eq!(h.state().await, ConnectionState::Pausing);
        assert_eq!(h.backend.starts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_regeneration_success_ignored_while_disconnecting() {
        let mut h = harness(SelectionSettings::default()).await;
        h.connect().await;
        h.handle.disconnect();
        settle().await;
        h.events.drain();

        h.keys.reporter().generated();
        settle().await;

        assert_eq!(h.events.drain(), vec![ControllerEvent::KeyRegenerated]);
        assert_eq!(h.state().await, ConnectionState::Disconnecting);
        assert_eq!(h.backend.starts().len(), 1);
        assert_eq!(h.backend.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tunnel_down_while_paused_keeps_timer() {
        let mut h = harness(SelectionSettings::default()).await;
        h.connect().await;
        h.pause_until_paused(Duration::from_secs(30)).await;
        h.events.drain();

        h.backend.report(TunnelStatus::Down);
        settle().await;

        let events = h.events.drain();
        assert_eq!(states(&events), vec![ConnectionState::NotConnected]);
        assert!(events.contains(&ControllerEvent::CheckSession));
        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, ConnectionState::NotConnected);
        assert!(snapshot.pause_remaining > Duration::from_secs(29));

        tokio::time::sleep(Duration::from_secs(31)).await;
        let events = h.events.drain();
        assert_eq!(states(&events), vec![ConnectionState::Connecting]);
        assert!(events.contains(&ControllerEvent::TimerFinished));
        assert_eq!(h.backend.starts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_failure_count_resets_on_connect() {
        let mut h = harness(SelectionSettings::default()).await;
        h.keys.set_expired(true, false);

        for _ in 0..5 {
            h.keys.reporter().failed(KeyErrorCode::Other(None), "timeout");
            settle().await;
            h.backend.report(TunnelStatus::Up);
            settle().await;
            assert_eq!(h.state().await, ConnectionState::Connected);
            h.handle.disconnect();
            settle().await;
            h.backend.report(TunnelStatus::Down);
            settle().await;
            assert_eq!(h.state().await, ConnectionState::NotConnected);
        }

        let events = h.events.drain();
        assert!(!events.contains(&ControllerEvent::KeyRegenerationError(
            RegenerationErrorKind::RetriesExhausted
        )));
        assert_eq!(h.keys.alarms(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fastest_server_cached() {
        let settings = SelectionSettings {
            fastest_server: true,
            ..Default::default()
        };
        let mut h = harness(settings).await;
        h.publisher.publish(Some(servers()[2].clone()));

        h.handle.action_by_user();
        settle().await;

        assert_eq!(
            h.events.drain(),
            vec![
                ControllerEvent::StateChanged(ConnectionState::Connecting),
                ControllerEvent::FindingFastestServer,
                ControllerEvent::ServerChosen {
                    server: servers()[2].clone(),
                    role: ServerRole::Entry,
                    reason: ServerChoiceReason::Fastest,
                },
            ]
        );
        assert_eq!(h.backend.starts()[0].entry.as_ref().unwrap().id, "s2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fastest_server_falls_back_to_default_after_poll() {
        let settings = SelectionSettings {
            fastest_server: true,
            ..Default::default()
        };
        let mut h = harness(settings).await;

        h.handle.action_by_user();
        settle().await;
        assert_eq!(
            h.events.drain(),
            vec![
                ControllerEvent::StateChanged(ConnectionState::Connecting),
                ControllerEvent::FindingFastestServer,
            ]
        );
        assert!(h.backend.starts().is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            h.events.drain(),
            vec![ControllerEvent::ServerChosen {
                server: servers()[0].clone(),
                role: ServerRole::Entry,
                reason: ServerChoiceReason::Fastest,
            }]
        );
        assert_eq!(h.backend.starts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fastest_server_published_during_poll() {
        let settings = SelectionSettings {
            fastest_server: true,
            ..Default::default()
        };
        let h = harness(settings).await;

        h.handle.action_by_user();
        settle().await;
        h.publisher.publish(Some(servers()[1].clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(h.backend.starts()[0].entry.as_ref().unwrap().id, "s1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fastest_poll_after_disconnect() {
        let settings = SelectionSettings {
            fastest_server: true,
            ..Default::default()
        };
        let mut h = harness(settings).await;

        h.handle.action_by_user();
        settle().await;
        h.handle.disconnect();
        settle().await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(
            states(&h.events.drain()),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Disconnecting,
                ConnectionState::NotConnected,
            ]
        );
        assert!(h.backend.starts().is_empty());
        assert_eq!(h.state().await, ConnectionState::NotConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multihop_skips_fastest_server() {
        let settings = SelectionSettings {
            fastest_server: true,
            multihop: true,
            ..Default::default()
        };
        let mut h = harness(settings).await;
        h.publisher.publish(Some(servers()[2].clone()));

        h.handle.action_by_user();
        settle().await;

        let events = h.events.drain();
        assert!(!events.contains(&ControllerEvent::FindingFastestServer));
        let start = &h.backend.starts()[0];
        assert_eq!(start.entry.as_ref().unwrap().id, "s0");
        assert_eq!(start.exit.as_ref().unwrap().id, "s1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_servers_announced_before_start() {
        let settings = SelectionSettings {
            multihop: true,
            random_entry: true,
            random_exit: true,
            ..Default::default()
        };
        let mut h = harness(settings).await;

        h.handle.action_by_user();
        settle().await;

        let events = h.events.drain();
        let chosen: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ControllerEvent::ServerChosen {
                    server,
                    role,
                    reason: ServerChoiceReason::Random,
                } => Some((*role, server.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(chosen.len(), 2);

        let starts = h.backend.starts();
        assert_eq!(starts.len(), 1);
        let entry = starts[0].entry.clone().unwrap();
        let exit = starts[0].exit.clone().unwrap();
        assert_ne!(entry.id, exit.id);
        assert!(chosen.contains(&(ServerRole::Entry, entry)));
        assert!(chosen.contains(&(ServerRole::Exit, exit)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_selection_times_out() {
        let settings = SelectionSettings {
            random_entry: true,
            ..Default::default()
        };
        let h = harness_with(settings, true).await;

        h.handle.action_by_user();
        settle().await;
        assert!(h.backend.starts().is_empty());

        tokio::time::sleep(Duration::from_millis(2100)).await;
        let starts = h.backend.starts();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].entry.as_ref().unwrap().id, "s0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_absorbs_teardown() {
        let mut h = harness(SelectionSettings::default()).await;
        h.connect().await;

        h.handle.reconnect();
        settle().await;
        h.backend.report(TunnelStatus::Down);
        settle().await;
        h.backend.report(TunnelStatus::Up);
        settle().await;

        let events = h.events.drain();
        assert_eq!(
            states(&events),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert!(!events.contains(&ControllerEvent::CheckSession));
        assert_eq!(h.backend.stops(), 1);
        assert_eq!(h.backend.starts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tunnel_failure_while_connecting() {
        let mut h = harness(SelectionSettings::default()).await;
        h.handle.action_by_user();
        settle().await;
        h.backend.report(TunnelStatus::Down);
        settle().await;

        assert_eq!(
            h.events.drain(),
            vec![
                ControllerEvent::StateChanged(ConnectionState::Connecting),
                ControllerEvent::StateChanged(ConnectionState::NotConnected),
                ControllerEvent::CheckSession,
            ]
        );
        assert_eq!(h.backend.starts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tunnel_up_ignored_when_idle() {
        let mut h = harness(SelectionSettings::default()).await;
        h.backend.report(TunnelStatus::Up);
        settle().await;
        assert!(h.events.drain().is_empty());
        assert_eq!(h.state().await, ConnectionState::NotConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_twice_is_idempotent() {
        let mut h = harness(SelectionSettings::default()).await;
        h.connect().await;

        h.handle.stop();
        settle().await;
        assert_eq!(h.state().await, ConnectionState::NotConnected);
        h.handle.stop();
        settle().await;
        assert_eq!(h.state().await, ConnectionState::NotConnected);

        assert_eq!(states(&h.events.drain()), vec![ConnectionState::NotConnected]);
        assert_eq!(h.backend.stops(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_listener_gets_replay() {
        let mut h = harness(SelectionSettings::default()).await;
        h.connect().await;

        let mut late = h.handle.add_state_listener();
        settle().await;
        assert_eq!(
            late.drain(),
            vec![ControllerEvent::StateChanged(ConnectionState::Connected)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_listener_receives_nothing() {
        let mut h = harness(SelectionSettings::default()).await;
        let mut other = h.handle.add_state_listener();
        settle().await;
        other.drain();

        h.handle.remove_state_listener(other.id());
        h.handle.action_by_user();
        settle().await;

        assert!(other.drain().is_empty());
        assert_eq!(states(&h.events.drain()), vec![ConnectionState::Connecting]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_vpn_state_includes_remaining() {
        let mut h = harness(SelectionSettings::default()).await;
        h.connect().await;
        h.pause_until_paused(Duration::from_secs(30)).await;
        h.events.drain();

        h.handle.notify_vpn_state();
        settle().await;

        let events = h.events.drain();
        assert_eq!(events[0], ControllerEvent::StateChanged(ConnectionState::Paused));
        assert!(matches!(
            events[1],
            ControllerEvent::TimerTick { remaining } if remaining > Duration::from_secs(29)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_actions() {
        let mut h = harness(SelectionSettings::default()).await;
        h.connect().await;

        h.actions.send("launch".to_string()).unwrap();
        settle().await;
        assert!(h.events.drain().is_empty());

        h.actions.send("PAUSE".to_string()).unwrap();
        settle().await;
        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, ConnectionState::Pausing);
        assert!(snapshot.pause_remaining > Duration::from_secs(59));

        h.backend.report(TunnelStatus::Down);
        h.handle.deliver_action("resume");
        settle().await;
        assert_eq!(h.state().await, ConnectionState::Connecting);

        h.actions.send("stop".to_string()).unwrap();
        settle().await;
        assert_eq!(h.state().await, ConnectionState::NotConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_settings_applies_to_next_attempt() {
        let h = harness(SelectionSettings::default()).await;
        h.handle.update_settings(SelectionSettings {
            multihop: true,
            ..Default::default()
        });
        let snapshot = h.handle.snapshot().await.unwrap();
        assert!(snapshot.settings.multihop);
        assert_eq!(snapshot.selection.exit.unwrap().id, "s1");

        h.handle.action_by_user();
        settle().await;
        assert!(h.backend.starts()[0].is_multihop());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_releases_everything() {
        let mut h = harness(SelectionSettings::default()).await;
        h.connect().await;

        h.handle.destroy();
        h.handle.closed().await;

        assert_eq!(
            h.events.recv().await,
            Some(ControllerEvent::StateChanged(ConnectionState::NotConnected))
        );
        assert_eq!(h.events.recv().await, None);
        assert!(h.backend.detached.load(Ordering::SeqCst));
        assert!(h.keys.detached.load(Ordering::SeqCst));
        assert_eq!(h.backend.stops(), 1);
        assert!(h.handle.snapshot().await.is_none());

        h.handle.destroy();
        h.handle.action_by_user();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handles_shuts_down() {
        let h = harness(SelectionSettings::default()).await;
        let Harness {
            handle,
            backend,
            mut events,
            ..
        } = h;
        let clone = handle.clone();
        drop(handle);
        drop(clone);

        while events.recv().await.is_some() {}
        assert!(backend.detached.load(Ordering::SeqCst));
    }
}
