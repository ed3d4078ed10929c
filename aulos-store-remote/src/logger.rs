//! The sink for log traffic the daemon interleaves with responses.
//!
//! The stderr sub-protocol forwards the daemon's logger verbatim: free-form
//! messages plus structured activity start/stop/result events. The client
//! pushes them into an [`ActivityLogger`] passed in at construction rather
//! than a process-wide logger, so tests can capture them.

use std::fmt;

/// A single typed field of an activity event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoggerField {
    Int(u64),
    String(String),
}

impl fmt::Display for LoggerField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoggerField::Int(n) => write!(f, "{n}"),
            LoggerField::String(s) => f.write_str(s),
        }
    }
}

/// Receives daemon-side log events. Implementations must be callable from
/// multiple connections at once.
pub trait ActivityLogger: Send + Sync {
    /// A plain log line (the `NEXT` message), already chomped.
    fn message(&self, text: &str);

    fn start_activity(
        &self,
        id: u64,
        level: u64,
        activity_type: u64,
        text: &str,
        fields: &[LoggerField],
        parent: u64,
    );

    fn stop_activity(&self, id: u64);

    fn result(&self, id: u64, result_type: u64, fields: &[LoggerField]);
}

/// Default logger: everything goes to `tracing`.
#[derive(Debug, Default)]
pub struct TracingLogger;

impl ActivityLogger for TracingLogger {
    fn message(&self, text: &str) {
        tracing::error!(target: "aulos::daemon", "{text}");
    }

    fn start_activity(
        &self,
        id: u64,
        level: u64,
        activity_type: u64,
        text: &str,
        _fields: &[LoggerField],
        parent: u64,
    ) {
        tracing::debug!(
            target: "aulos::daemon",
            id,
            level,
            activity_type,
            parent,
            "start activity: {text}"
        );
    }

    fn stop_activity(&self, id: u64) {
        tracing::debug!(target: "aulos::daemon", id, "stop activity");
    }

    fn result(&self, id: u64, result_type: u64, fields: &[LoggerField]) {
        tracing::trace!(
            target: "aulos::daemon",
            id,
            result_type,
            fields = fields.len(),
            "activity result"
        );
    }
}
