//! Pause timer.
//!
//! A cancellable countdown that reports periodic ticks and one completion
//! through a callback. The countdown runs in a spawned tokio task; the owner
//! keeps the [`PauseTimer`] on its own execution context and uses the
//! generation number carried by every [`TimerSignal`] to discard signals that
//! were already in flight when the timer was stopped or restarted.
//!
//! # Timeline
//!
//! ```text
//!   start(5s), tick = 1s
//!
//!   t=0    Tick { remaining: 5s }
//!   t=1    Tick { remaining: 4s }
//!   ...
//!   t=4    Tick { remaining: 1s }
//!   t=5    Finished
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use vpnctl::timer::{PauseTimer, TimerSignal};
//!
//! # async fn example() {
//! let mut timer = PauseTimer::new(
//!     Duration::from_secs(1),
//!     Arc::new(|signal: TimerSignal| println!("{:?}", signal)),
//! );
//! timer.start(Duration::from_secs(5));
//! assert!(timer.is_running());
//! timer.stop();
//! assert_eq!(timer.remaining(), Duration::ZERO);
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Signal emitted by a running countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSignal {
    /// Periodic tick.
    Tick {
        /// Countdown that produced the tick.
        generation: u64,
        /// Time left until completion.
        remaining: Duration,
    },
    /// The countdown elapsed.
    Finished {
        /// Countdown that finished.
        generation: u64,
    },
}

impl TimerSignal {
    /// Returns the generation of the countdown that produced the signal.
    pub fn generation(&self) -> u64 {
        match self {
            TimerSignal::Tick { generation, .. } | TimerSignal::Finished { generation } => {
                *generation
            }
        }
    }
}

/// Callback receiving timer signals. Invoked from the countdown task.
pub type TimerCallback = Arc<dyn Fn(TimerSignal) + Send + Sync>;

/// Cancellable countdown with tick and completion callbacks.
///
/// Starting while running restarts from the new duration. Stopping before
/// completion suppresses the completion.
pub struct PauseTimer {
    tick: Duration,
    callback: TimerCallback,
    generation: u64,
    deadline: Option<Instant>,
    task: Option<JoinHandle<()>>,
}

impl PauseTimer {
    /// Creates a stopped timer ticking every `tick`.
    ///
    /// A zero `tick` is raised to one millisecond.
    pub fn new(tick: Duration, callback: TimerCallback) -> Self {
        Self {
            tick: tick.max(Duration::from_millis(1)),
            callback,
            generation: 0,
            deadline: None,
            task: None,
        }
    }

    /// Starts (or restarts) the countdown. Returns its generation.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, duration: Duration) -> u64 {
        self.abort_task();
        self.generation += 1;

        let generation = self.generation;
        let started = Instant::now();
        let deadline = started + duration;
        let tick = self.tick;
        let callback = self.callback.clone();

        self.deadline = Some(deadline);
        self.task = Some(tokio::spawn(async move {
            let mut next_tick = started;
            while next_tick < deadline {
                sleep_until(next_tick).await;
                callback(TimerSignal::Tick {
                    generation,
                    remaining: deadline.saturating_duration_since(Instant::now()),
                });
                next_tick += tick;
            }
            sleep_until(deadline).await;
            callback(TimerSignal::Finished { generation });
        }));

        generation
    }

    /// Stops the countdown. No further signals of the current generation are
    /// treated as current.
    pub fn stop(&mut self) {
        self.abort_task();
        if self.deadline.take().is_some() {
            self.generation += 1;
        }
    }

    /// Returns time left, or zero when stopped.
    pub fn remaining(&self) -> Duration {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Returns `true` while a countdown is armed.
    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    /// Returns `true` if `generation` is the armed countdown.
    pub fn is_current(&self, generation: u64) -> bool {
        self.deadline.is_some() && generation == self.generation
    }

    /// Marks the countdown `generation` as finished.
    ///
    /// Returns `false`, leaving the timer untouched, if `generation` is stale.
    pub fn complete(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.deadline = None;
        self.task = None;
        true
    }

    fn abort_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for PauseTimer {
    fn drop(&mut self) {
        self.abort_task();
    }
}

impl std::fmt::Debug for PauseTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PauseTimer")
            .field("tick", &self.tick)
            .field("generation", &self.generation)
            .field("remaining", &self.remaining())
            .finish()
    }
}
