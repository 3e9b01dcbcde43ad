//! User-facing event reporting.

use std::fmt;
use tracing::{debug, info, warn};

/// Severity of a reported event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Diagnostic detail
    Debug,
    /// Informational
    Info,
    /// Something the user should look at
    Warning,
}

/// A message for the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Severity
    pub kind: EventKind,
    /// Message
    pub message: String,
}

impl Event {
    /// Debug event
    #[must_use]
    pub fn debug(message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Debug,
            message: message.into(),
        }
    }

    /// Info event
    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Info,
            message: message.into(),
        }
    }

    /// Warning event
    #[must_use]
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Warning,
            message: message.into(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.kind {
            EventKind::Debug => "DEBUG",
            EventKind::Info => "INFO",
            EventKind::Warning => "WARNING",
        };
        write!(f, "{level}: {}", self.message)
    }
}

/// Receives user-facing events
pub trait Reporter: Send + Sync {
    /// Handle one event
    fn handle(&self, event: &Event);
}

/// Reporter that forwards events to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn handle(&self, event: &Event) {
        match event.kind {
            EventKind::Debug => debug!(target: "remex::events", "{}", event.message),
            EventKind::Info => info!(target: "remex::events", "{}", event.message),
            EventKind::Warning => warn!(target: "remex::events", "{}", event.message),
        }
    }
}
