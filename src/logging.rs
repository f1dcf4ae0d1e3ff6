//! Logging capability passed into pipeline components.
//!
//! Components receive an `Arc<dyn Logger>` at construction instead of
//! writing to a process-wide logger. Production wiring uses
//! [`TracingLogger`]; tests substitute [`NoopLogger`] or [`RecordingLogger`].

use std::sync::{Arc, Mutex};
use tracing::Level;

pub trait Logger: Send + Sync {
    fn log(&self, level: Level, component: &str, message: &str);

    fn debug(&self, component: &str, message: &str) {
        self.log(Level::DEBUG, component, message);
    }
    fn info(&self, component: &str, message: &str) {
        self.log(Level::INFO, component, message);
    }
    fn warn(&self, component: &str, message: &str) {
        self.log(Level::WARN, component, message);
    }
    fn error(&self, component: &str, message: &str) {
        self.log(Level::ERROR, component, message);
    }
}

/// Forwards to `tracing` events with a `component` field.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Level, component: &str, message: &str) {
        // tracing levels must be known at the callsite
        match level {
            Level::ERROR => tracing::error!(component, "{}", message),
            Level::WARN => tracing::warn!(component, "{}", message),
            Level::INFO => tracing::info!(component, "{}", message),
            Level::DEBUG => tracing::debug!(component, "{}", message),
            Level::TRACE => tracing::trace!(component, "{}", message),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(&self, _level: Level, _component: &str, _message: &str) {}
}

/// A captured log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub level: Level,
    pub component: String,
    pub message: String,
}

/// Keeps every entry in memory for assertions.
#[derive(Debug, Default)]
pub struct RecordingLogger {
    entries: Mutex<Vec<LogEntry>>,
}

impl RecordingLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Entries at `level` whose message contains `needle`.
    pub fn count_matching(&self, level: Level, needle: &str) -> usize {
        self.entries()
            .iter()
            .filter(|e| e.level == level && e.message.contains(needle))
            .count()
    }
}

impl Logger for RecordingLogger {
    fn log(&self, level: Level, component: &str, message: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(LogEntry {
                level,
                component: component.to_string(),
                message: message.to_string(),
            });
        }
    }
}
