//! State listener fan-out.
//!
//! Each listener is one unbounded channel. The controller owns a
//! [`ListenerSet`] and is the only writer; subscribers hold a
//! [`Subscription`] and read at their own pace.
//!
//! # Dispatch Rules
//!
//! - Every listener receives every event, in the order the controller
//!   dispatched them.
//! - A new listener first receives the current state (replay on subscribe).
//! - Listeners whose receiving side was dropped are pruned on the next
//!   dispatch.
//! - Adding or removing listeners from inside a subscriber task is safe: such
//!   requests are queued to the controller and applied between dispatches.

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use crate::config::LogLevel;
use crate::event::ControllerEvent;
use crate::logger::plog;

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// Receiving side of a listener registration.
///
/// Dropping the subscription unregisters it lazily; call
/// [`ControllerHandle::remove_state_listener`](crate::ControllerHandle::remove_state_listener)
/// to unregister eagerly.
#[derive(Debug)]
pub struct Subscription {
    id: ListenerId,
    rx: UnboundedReceiver<ControllerEvent>,
}

impl Subscription {
    /// Creates a subscription and the sender the controller dispatches to.
    pub(crate) fn channel(id: ListenerId) -> (UnboundedSender<ControllerEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { id, rx })
    }

    /// Returns the listener id.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Waits for the next event. Returns `None` once the controller has
    /// removed this listener or shut down.
    pub async fn recv(&mut self) -> Option<ControllerEvent> {
        self.rx.recv().await
    }

    /// Returns the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<ControllerEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Drains every queued event.
    pub fn drain(&mut self) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

/// The controller's set of listeners.
#[derive(Debug, Default)]
pub struct ListenerSet {
    listeners: Vec<(ListenerId, UnboundedSender<ControllerEvent>)>,
}

impl ListenerSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener and sends it `replay` first.
    ///
    /// Re-registering an existing id replaces its sender.
    pub fn add(
        &mut self,
        id: ListenerId,
        tx: UnboundedSender<ControllerEvent>,
        replay: ControllerEvent,
    ) {
        self.listeners.retain(|(existing, _)| *existing != id);
        if tx.send(replay).is_err() {
            plog(LogLevel::Debug, &format!("{} dropped before registration", id));
            return;
        }
        self.listeners.push((id, tx));
    }

    /// Unregisters a listener. Returns `true` if it was registered.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        before != self.listeners.len()
    }

    /// Sends `event` to every listener, pruning closed ones.
    pub fn dispatch(&mut self, event: &ControllerEvent) {
        let snapshot: Vec<_> = self.listeners.clone();
        let mut closed = Vec::new();
        for (id, tx) in snapshot {
            if tx.send(event.clone()).is_err() {
                closed.push(id);
            }
        }
        if !closed.is_empty() {
            self.listeners.retain(|(id, _)| !closed.contains(id));
            plog(
                LogLevel::Debug,
                &format!("Pruned {} closed listener(s)", closed.len()),
            );
        }
    }

    /// Removes every listener, closing their subscriptions.
    pub fn clear(&mut self) {
        self.listeners.clear();
    }

    /// Returns the number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Returns `true` when no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
