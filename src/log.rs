//! The log sink seam between the relay core and whoever consumes its events.
//!
//! The controller and every session receive a [`Logger`] at construction and
//! push `(timestamp, severity, component, message)` records through it. What
//! happens to a record afterwards is up to the [`LogSink`] behind the logger.

use std::{
    fmt::{self, Display},
    sync::Arc,
    time::SystemTime,
};

use sockrelay_model::Severity;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: SystemTime,
    pub severity: Severity,
    pub component: &'static str,
    pub message: String,
}

impl Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}\t{}", self.severity, self.component, self.message)
    }
}

pub trait LogSink: Send + Sync {
    fn write(&self, record: LogRecord);
}

/// Subscribing with a channel: every record that passes the threshold is
/// sent, and records are silently dropped once the receiver is gone.
impl LogSink for UnboundedSender<LogRecord> {
    fn write(&self, record: LogRecord) {
        let _ = self.send(record);
    }
}

/// Forwards records into `tracing`, which is where the console output of the
/// host process comes from.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, record: LogRecord) {
        let LogRecord {
            severity,
            component,
            message,
            ..
        } = record;

        match severity {
            Severity::Verbose => tracing::trace!(component, %severity, "{message}"),
            Severity::Trace => tracing::debug!(component, %severity, "{message}"),
            Severity::Information => tracing::info!(component, %severity, "{message}"),
            Severity::Warning => tracing::warn!(component, %severity, "{message}"),
            Severity::Error | Severity::Critical => {
                tracing::error!(component, %severity, "{message}")
            }
        }
    }
}

/// Cheaply clonable handle onto a [`LogSink`] with a minimum severity.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
    min_severity: Severity,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("min_severity", &self.min_severity)
            .finish_non_exhaustive()
    }
}

impl Logger {
    pub fn new(sink: Arc<dyn LogSink>, min_severity: Severity) -> Self {
        Logger { sink, min_severity }
    }

    pub fn tracing(min_severity: Severity) -> Self {
        Logger::new(Arc::new(TracingSink), min_severity)
    }

    pub fn enabled(&self, severity: Severity) -> bool {
        severity >= self.min_severity
    }

    /// Records below the threshold are dropped before `message` is formatted.
    pub fn log(&self, severity: Severity, component: &'static str, message: impl Display) {
        if !self.enabled(severity) {
            return;
        }

        self.sink.write(LogRecord {
            timestamp: SystemTime::now(),
            severity,
            component,
            message: message.to_string(),
        });
    }

    pub fn verbose(&self, component: &'static str, message: impl Display) {
        self.log(Severity::Verbose, component, message)
    }

    pub fn information(&self, component: &'static str, message: impl Display) {
        self.log(Severity::Information, component, message)
    }

    pub fn error(&self, component: &'static str, message: impl Display) {
        self.log(Severity::Error, component, message)
    }

    pub fn critical(&self, component: &'static str, message: impl Display) {
        self.log(Severity::Critical, component, message)
    }
}
