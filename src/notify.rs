//! Operator notification sink.

use core::fmt::Debug;

/// Severity attached to an operator notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    /// Routine progress, e.g. a confirmed fill.
    Info,
    /// Degraded but recovering, e.g. a stalled stream.
    Warning,
    /// Operator action needed, e.g. trading halted.
    Critical,
}

/// A sink for operator-facing notifications.
///
/// The engine reports lifecycle milestones, stream-health episodes, and halt
/// decisions through this trait; where the messages end up (chat webhook,
/// pager, stdout) is up to the implementor.
pub trait Notifier: Send + Sync + Debug {
    /// Deliver one message at the given level. Must not block the caller for
    /// long; slow sinks should queue internally.
    fn notify(&self, level: NotifyLevel, message: &str);
}

/// A [`Notifier`] that forwards everything to the log and drops it.
#[derive(Debug, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, level: NotifyLevel, message: &str) {
        match level {
            NotifyLevel::Info => log::info!("notify: {message}"),
            NotifyLevel::Warning => log::warn!("notify: {message}"),
            NotifyLevel::Critical => log::error!("notify: {message}"),
        }
    }
}
