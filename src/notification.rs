//! Notification boundary.
//!
//! The presentation layer receives one [`NotificationSignal`] per state
//! change. Sinks must tolerate duplicate signals.

use std::time::Duration;

use crate::config::LogLevel;
use crate::event::NotificationSignal;
use crate::logger::plog;

/// Receiver of state signals for the presentation layer.
pub trait NotificationSink: Send + Sync {
    /// Shows `signal`.
    fn signal(&self, signal: NotificationSignal);
}

/// Sink that writes signals to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn signal(&self, signal: NotificationSignal) {
        let text = match signal {
            NotificationSignal::Disconnected => "Disconnected".to_string(),
            NotificationSignal::Connecting => "Connecting...".to_string(),
            NotificationSignal::Connected => "Connected".to_string(),
            NotificationSignal::Paused { remaining } => {
                format!("Paused, resuming in {}", format_countdown(remaining))
            }
        };
        plog(LogLevel::Notice, &format!("[notification] {}", text));
    }
}

/// Formats a countdown as `MM:SS`, or `H:MM:SS` from one hour up.
///
/// Sub-second remainders round up so a countdown never shows `00:00` while
/// time is left.
///
/// ```rust
/// use std::time::Duration;
/// use vpnctl::notification::format_countdown;
///
/// assert_eq!(format_countdown(Duration::from_secs(65)), "01:05");
/// assert_eq!(format_countdown(Duration::from_millis(500)), "00:01");
/// assert_eq!(format_countdown(Duration::from_secs(3725)), "1:02:05");
/// ```
pub fn format_countdown(remaining: Duration) -> String {
    let mut secs = remaining.as_secs();
    if remaining.subsec_nanos() > 0 {
        secs += 1;
    }
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}
