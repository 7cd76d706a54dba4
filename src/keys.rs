//! Key controller boundary.
//!
//! The key controller owns credential freshness. The controller asks it
//! whether the current key is expired and tells it to regenerate; outcomes
//! come back as [`KeyEvent`]s through the attached [`KeyEventReporter`].
//!
//! # Expiry
//!
//! | Condition | Meaning | Controller reaction |
//! |-----------|---------|---------------------|
//! | soft expired | due for rotation, still usable | regenerate before connecting |
//! | hard expired | unusable without the user | surface `UpgradeRequired` |
//!
//! # Error Codes
//!
//! Regeneration failures carry the HTTP-style status of the key service,
//! mapped by [`KeyErrorCode::from_status`]:
//!
//! | Status | Code | Dialog |
//! |--------|------|--------|
//! | 423 | [`KeyLimitReached`](KeyErrorCode::KeyLimitReached) | maximum keys reached |
//! | 424 | [`KeyNotFound`](KeyErrorCode::KeyNotFound) | upgrade required |
//! | other | [`Other`](KeyErrorCode::Other) | retried (bounded) |

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;

use crate::config::{KeysConfig, LogLevel};
use crate::logger::plog;

/// Classified cause of a regeneration failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyErrorCode {
    /// The service does not know the key.
    KeyNotFound,
    /// The account holds the maximum number of keys.
    KeyLimitReached,
    /// Any other failure, with its status if one was received.
    Other(Option<u16>),
}

impl KeyErrorCode {
    /// Status returned when the key limit is reached.
    pub const KEY_LIMIT_REACHED_STATUS: u16 = 423;
    /// Status returned when the key is unknown.
    pub const KEY_NOT_FOUND_STATUS: u16 = 424;

    /// Maps a service status to a code.
    pub fn from_status(status: Option<u16>) -> Self {
        match status {
            Some(Self::KEY_NOT_FOUND_STATUS) => KeyErrorCode::KeyNotFound,
            Some(Self::KEY_LIMIT_REACHED_STATUS) => KeyErrorCode::KeyLimitReached,
            other => KeyErrorCode::Other(other),
        }
    }
}

impl std::fmt::Display for KeyErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyErrorCode::KeyNotFound => write!(f, "key not found"),
            KeyErrorCode::KeyLimitReached => write!(f, "key limit reached"),
            KeyErrorCode::Other(Some(status)) => write!(f, "status {}", status),
            KeyErrorCode::Other(None) => write!(f, "no status"),
        }
    }
}

/// Event reported by a key controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEvent {
    /// Regeneration started.
    Generating,
    /// Regeneration succeeded.
    Generated,
    /// Regeneration failed.
    Failed {
        /// Classified cause.
        code: KeyErrorCode,
        /// Human-readable detail.
        cause: String,
    },
}

/// Channel back to the controller for key events.
#[derive(Clone)]
pub struct KeyEventReporter {
    report: Arc<dyn Fn(KeyEvent) + Send + Sync>,
}

impl KeyEventReporter {
    /// Wraps a callback.
    pub fn new(report: impl Fn(KeyEvent) + Send + Sync + 'static) -> Self {
        Self {
            report: Arc::new(report),
        }
    }

    /// Reports that regeneration started.
    pub fn generating(&self) {
        (self.report)(KeyEvent::Generating)
    }

    /// Reports that regeneration succeeded.
    pub fn generated(&self) {
        (self.report)(KeyEvent::Generated)
    }

    /// Reports that regeneration failed.
    pub fn failed(&self, code: KeyErrorCode, cause: impl Into<String>) {
        (self.report)(KeyEvent::Failed {
            code,
            cause: cause.into(),
        })
    }
}

impl std::fmt::Debug for KeyEventReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEventReporter").finish_non_exhaustive()
    }
}

/// Credential owner consumed by the controller.
pub trait KeyController: Send + Sync {
    /// Installs the event reporter, replacing any previous one.
    fn attach(&self, reporter: KeyEventReporter);

    /// Removes the event reporter.
    fn detach(&self);

    /// Returns `true` when the key is due for rotation.
    fn is_expired(&self) -> bool;

    /// Returns `true` when the key can no longer be rotated.
    fn is_hard_expired(&self) -> bool;

    /// Starts regeneration. The outcome is reported asynchronously.
    fn regenerate(&self);

    /// Schedules a regeneration retry after a short delay.
    fn start_short_retry_alarm(&self);
}

struct LocalKeyState {
    reporter: Option<KeyEventReporter>,
    generated_at: DateTime<Utc>,
    pending: Option<JoinHandle<()>>,
    alarm: Option<JoinHandle<()>>,
    failures: VecDeque<KeyErrorCode>,
}

/// In-process key controller with wall-clock expiry and simulated
/// regeneration latency.
///
/// Queued failures (see [`queue_failure`](Self::queue_failure)) are consumed
/// by the next regenerations in order. A hard-expired key cannot be
/// regenerated.
#[derive(Clone)]
pub struct LocalKeyController {
    rotation: TimeDelta,
    hard_expiry: TimeDelta,
    short_retry: Duration,
    delay: Duration,
    state: Arc<Mutex<LocalKeyState>>,
}

impl LocalKeyController {
    /// Creates a controller whose key was generated now.
    pub fn new(config: &KeysConfig) -> Self {
        Self::with_generated_at(config, Utc::now())
    }

    /// Creates a controller whose key was generated at `generated_at`.
    pub fn with_generated_at(config: &KeysConfig, generated_at: DateTime<Utc>) -> Self {
        Self {
            rotation: TimeDelta::hours(i64::from(config.rotation_interval_hours)),
            hard_expiry: TimeDelta::hours(i64::from(config.hard_expiry_hours)),
            short_retry: Duration::from_secs(config.short_retry_secs),
            delay: Duration::from_millis(config.regeneration_delay_ms),
            state: Arc::new(Mutex::new(LocalKeyState {
                reporter: None,
                generated_at,
                pending: None,
                alarm: None,
                failures: VecDeque::new(),
            })),
        }
    }

    /// Returns when the current key was generated.
    pub fn generated_at(&self) -> DateTime<Utc> {
        self.lock().generated_at
    }

    /// Makes the next regeneration fail with `code`.
    pub fn queue_failure(&self, code: KeyErrorCode) {
        self.lock().failures.push_back(code);
    }

    /// Returns `true` while a short retry alarm is armed.
    pub fn retry_alarm_armed(&self) -> bool {
        self.lock()
            .alarm
            .as_ref()
            .is_some_and(|alarm| !alarm.is_finished())
    }

    fn lock(&self) -> MutexGuard<'_, LocalKeyState> {
        lock_state(&self.state)
    }

    fn age(&self) -> TimeDelta {
        Utc::now() - self.generated_at()
    }
}

fn lock_state(state: &Mutex<LocalKeyState>) -> MutexGuard<'_, LocalKeyState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn spawn_regeneration(state: &Arc<Mutex<LocalKeyState>>, delay: Duration, hard_expiry: TimeDelta) {
    let mut guard = lock_state(state);
    if guard.pending.as_ref().is_some_and(|task| !task.is_finished()) {
        plog(LogLevel::Debug, "Key regeneration already in progress");
        return;
    }
    let Some(reporter) = guard.reporter.clone() else {
        plog(LogLevel::Debug, "Key regeneration requested with no listener");
        return;
    };

    reporter.generating();
    let state = state.clone();
    guard.pending = Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let failure = {
            let mut guard = lock_state(&state);
            match guard.failures.pop_front() {
                Some(code) => Some(code),
                None if Utc::now() - guard.generated_at >= hard_expiry => {
                    Some(KeyErrorCode::Other(None))
                }
                None => None,
            }
        };
        match failure {
            Some(code) => {
                plog(LogLevel::Info, &format!("Key regeneration failed: {}", code));
                reporter.failed(code, format!("key service rejected request: {}", code));
            }
            None => {
                {
                    let mut guard = lock_state(&state);
                    guard.generated_at = Utc::now();
                    if let Some(alarm) = guard.alarm.take() {
                        alarm.abort();
                    }
                }
                plog(LogLevel::Info, "Key regenerated");
                reporter.generated();
            }
        }
    }));
}

impl KeyController for LocalKeyController {
    fn attach(&self, reporter: KeyEventReporter) {
        self.lock().reporter = Some(reporter);
    }

    fn detach(&self) {
        let mut state = self.lock();
        state.reporter = None;
        for task in [state.pending.take(), state.alarm.take()].into_iter().flatten() {
            task.abort();
        }
    }

    fn is_expired(&self) -> bool {
        self.age() >= self.rotation
    }

    fn is_hard_expired(&self) -> bool {
        self.age() >= self.hard_expiry
    }

    fn regenerate(&self) {
        spawn_regeneration(&self.state, self.delay, self.hard_expiry);
    }

    fn start_short_retry_alarm(&self) {
        let state = self.state.clone();
        let retry = self.short_retry;
        let delay = self.delay;
        let hard_expiry = self.hard_expiry;
        let alarm = tokio::spawn(async move {
            tokio::time::sleep(retry).await;
            spawn_regeneration(&state, delay, hard_expiry);
        });
        if let Some(previous) = self.lock().alarm.replace(alarm) {
            previous.abort();
        }
        plog(
            LogLevel::Info,
            &format!("Key retry alarm set for {}s", retry.as_secs()),
        );
    }
}

impl std::fmt::Debug for LocalKeyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeyController")
            .field("generated_at", &self.generated_at())
            .field("rotation", &self.rotation)
            .field("hard_expiry", &self.hard_expiry)
            .finish()
    }
}
