//! Tunnel backend boundary.
//!
//! The backend is the component that actually brings the encrypted tunnel up
//! and down. The controller only issues fire-and-forget
//! [`start`](TunnelBackend::start)/[`stop`](TunnelBackend::stop) calls and
//! learns the outcome through the [`StatusReporter`] it attached.
//!
//! # Interaction
//!
//! ```text
//!   Controller                     Backend
//!       │  attach(reporter)           │
//!       │ ──────────────────────────▶ │
//!       │  start(selection)           │
//!       │ ──────────────────────────▶ │
//!       │                             │  ... handshake ...
//!       │       reporter.report(Up)   │
//!       │ ◀────────────────────────── │
//!       │  stop()                     │
//!       │ ──────────────────────────▶ │
//!       │     reporter.report(Down)   │
//!       │ ◀────────────────────────── │
//! ```
//!
//! [`SimulatedBackend`] is a timer-driven stand-in used by the CLI and tests.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::{BackendConfig, LogLevel};
use crate::event::TunnelStatus;
use crate::logger::plog;
use crate::state::ServerSelection;

/// Channel back to the controller for tunnel status reports.
///
/// Cheap to clone; safe to call from any thread.
#[derive(Clone)]
pub struct StatusReporter {
    report: Arc<dyn Fn(TunnelStatus) + Send + Sync>,
}

impl StatusReporter {
    /// Wraps a callback.
    pub fn new(report: impl Fn(TunnelStatus) + Send + Sync + 'static) -> Self {
        Self {
            report: Arc::new(report),
        }
    }

    /// Reports a status change.
    pub fn report(&self, status: TunnelStatus) {
        (self.report)(status)
    }
}

impl std::fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter").finish_non_exhaustive()
    }
}

/// Opaque tunnel implementation driven by the controller.
///
/// All methods must return promptly; long work happens in the backend's own
/// tasks and is reported through the attached [`StatusReporter`].
pub trait TunnelBackend: Send + Sync {
    /// Installs the status reporter, replacing any previous one.
    fn attach(&self, reporter: StatusReporter);

    /// Removes the status reporter. Later status changes are not reported.
    fn detach(&self);

    /// Brings the tunnel up using `selection`.
    fn start(&self, selection: &ServerSelection);

    /// Tears the tunnel down.
    fn stop(&self);
}

#[derive(Default)]
struct SimulatedInner {
    reporter: Option<StatusReporter>,
    pending: Option<(TunnelStatus, JoinHandle<()>)>,
    active: bool,
    last_selection: Option<ServerSelection>,
}

/// Backend that reports `Up` a fixed delay after `start` and `Down` a fixed
/// delay after `stop`.
///
/// Stopping an inactive tunnel is a no-op and reports nothing. Starting while
/// a teardown is still pending reports that `Down` first.
pub struct SimulatedBackend {
    connect_delay: Duration,
    disconnect_delay: Duration,
    inner: Mutex<SimulatedInner>,
}

impl SimulatedBackend {
    /// Creates a backend with explicit delays.
    pub fn new(connect_delay: Duration, disconnect_delay: Duration) -> Self {
        Self {
            connect_delay,
            disconnect_delay,
            inner: Mutex::new(SimulatedInner::default()),
        }
    }

    /// Creates a backend from the `[backend]` config section.
    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(
            Duration::from_millis(config.connect_delay_ms),
            Duration::from_millis(config.disconnect_delay_ms),
        )
    }

    /// Returns `true` between `start` and `stop`.
    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Returns the selection of the most recent `start`.
    pub fn last_selection(&self) -> Option<ServerSelection> {
        self.lock().last_selection.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SimulatedInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn schedule(inner: &mut SimulatedInner, delay: Duration, status: TunnelStatus) {
        let mut teardown_pending = false;
        if let Some((pending, task)) = inner.pending.take() {
            teardown_pending = pending == TunnelStatus::Down && !task.is_finished();
            task.abort();
        }
        let Some(reporter) = inner.reporter.clone() else {
            return;
        };
        let report_down_first = teardown_pending && status == TunnelStatus::Up;
        let task = tokio::spawn(async move {
            if report_down_first {
                reporter.report(TunnelStatus::Down);
            }
            tokio::time::sleep(delay).await;
            reporter.report(status);
        });
        inner.pending = Some((status, task));
    }
}

impl TunnelBackend for SimulatedBackend {
    fn attach(&self, reporter: StatusReporter) {
        self.lock().reporter = Some(reporter);
    }

    fn detach(&self) {
        let mut inner = self.lock();
        inner.reporter = None;
        if let Some((_, task)) = inner.pending.take() {
            task.abort();
        }
    }

    fn start(&self, selection: &ServerSelection) {
        plog(
            LogLevel::Info,
            &format!("Simulated tunnel starting via {}", selection),
        );
        let mut inner = self.lock();
        inner.active = true;
        inner.last_selection = Some(selection.clone());
        Self::schedule(&mut inner, self.connect_delay, TunnelStatus::Up);
    }

    fn stop(&self) {
        let mut inner = self.lock();
        if !inner.active {
            plog(LogLevel::Debug, "Simulated tunnel already down");
            return;
        }
        plog(LogLevel::Info, "Simulated tunnel stopping");
        inner.active = false;
        Self::schedule(&mut inner, self.disconnect_delay, TunnelStatus::Down);
    }
}

impl std::fmt::Debug for SimulatedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedBackend")
            .field("connect_delay", &self.connect_delay)
            .field("disconnect_delay", &self.disconnect_delay)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Server;

    fn recording() -> (StatusReporter, Arc<Mutex<Vec<TunnelStatus>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        (
            StatusReporter::new(move |status| sink.lock().unwrap().push(status)),
            log,
        )
    }

    fn selection() -> ServerSelection {
        ServerSelection {
            entry: Some(Server::new("s0", "S0", "10.0.0.1:51820")),
            exit: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_then_stop_reports() {
        let backend = SimulatedBackend::new(Duration::from_millis(800), Duration::from_millis(200));
        let (reporter, log) = recording();
        backend.attach(reporter);

        backend.start(&selection());
        tokio::time::sleep(Duration::from_secs(1)).await;
        backend.stop();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(*log.lock().unwrap(), vec![TunnelStatus::Up, TunnelStatus::Down]);
        assert_eq!(backend.last_selection(), Some(selection()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_up_cancels_up() {
        let backend = SimulatedBackend::new(Duration::from_millis(800), Duration::from_millis(200));
        let (reporter, log) = recording();
        backend.attach(reporter);

        backend.start(&selection());
        tokio::time::sleep(Duration::from_millis(100)).await;
        backend.stop();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(*log.lock().unwrap(), vec![TunnelStatus::Down]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_reports_teardown_first() {
        let backend = SimulatedBackend::new(Duration::from_millis(800), Duration::from_millis(200));
        let (reporter, log) = recording();
        backend.attach(reporter);

        backend.start(&selection());
        tokio::time::sleep(Duration::from_secs(1)).await;
        backend.stop();
        backend.start(&selection());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![TunnelStatus::Up, TunnelStatus::Down, TunnelStatus::Up]
        );
        assert!(backend.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_inactive_is_silent() {
        let backend = SimulatedBackend::new(Duration::from_millis(10), Duration::from_millis(10));
        let (reporter, log) = recording();
        backend.attach(reporter);

        backend.stop();
        backend.stop();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(log.lock().unwrap().is_empty());
        assert!(!backend.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_silences_reports() {
        let backend = SimulatedBackend::new(Duration::from_millis(10), Duration::from_millis(10));
        let (reporter, log) = recording();
        backend.attach(reporter);
        backend.start(&selection());
        backend.detach();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(log.lock().unwrap().is_empty());
    }
}
