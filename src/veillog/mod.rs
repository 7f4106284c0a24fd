//! VEIL log: diagnostics for the frame pipeline.
//!
//! Rejected deltas, failing components, commits and loop aborts all flow
//! through one [`VeilLogger`], tagged with the frame they belong to, and fan
//! out to sinks. The default sink forwards to `tracing`; tests attach a
//! [`MemorySink`] and assert on what was recorded.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity levels, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Emitting component (e.g. "state", "effector:llm", "transform:cascade").
    pub source: String,
    /// Frame sequence the entry belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<u64>,
    pub message: String,
    /// Structured context, e.g. the failing component's role and name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            source: source.into(),
            frame: None,
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_frame(mut self, sequence: u64) -> Self {
        self.frame = Some(sequence);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Output target for log entries. Must be `Send + Sync`; effectors run on tasks.
pub trait LogSink: Send + Sync {
    fn write(&self, entry: &LogEntry);

    fn flush(&self) {}
}

pub struct VeilLogger {
    sinks: Vec<Arc<dyn LogSink>>,
    min_level: LogLevel,
}

impl VeilLogger {
    /// A logger with no sinks.
    pub fn new() -> Self {
        Self {
            sinks: Vec::new(),
            min_level: LogLevel::Trace,
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn LogSink>) {
        self.sinks.push(sink);
    }

    pub fn log(&self, entry: &LogEntry) {
        if entry.level < self.min_level {
            return;
        }
        for sink in &self.sinks {
            sink.write(entry);
        }
    }

    /// An entry outside any frame (registration, decoding, shutdown).
    pub fn record(&self, level: LogLevel, source: &str, message: impl Into<String>) {
        self.log(&LogEntry::new(level, source, message));
    }

    /// An entry belonging to frame `sequence`.
    pub fn record_at(
        &self,
        level: LogLevel,
        source: &str,
        sequence: u64,
        message: impl Into<String>,
    ) {
        self.log(&LogEntry::new(level, source, message).with_frame(sequence));
    }

    pub fn flush(&self) {
        for sink in &self.sinks {
            sink.flush();
        }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

impl Default for VeilLogger {
    /// Forwards to `tracing`, so an installed subscriber sees everything.
    fn default() -> Self {
        Self::new().with_sink(Arc::new(TracingSink))
    }
}

// ─── Sinks ──────────────────────────────────────────────────────────────────

/// Forwards entries to the `tracing` macros, frame and payload as fields.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, entry: &LogEntry) {
        let frame = entry.frame.unwrap_or(0);
        let payload = entry.payload.as_ref().map(Value::to_string).unwrap_or_default();
        match entry.level {
            LogLevel::Trace => {
                tracing::trace!(source = %entry.source, frame, %payload, "{}", entry.message)
            }
            LogLevel::Debug => {
                tracing::debug!(source = %entry.source, frame, %payload, "{}", entry.message)
            }
            LogLevel::Info => {
                tracing::info!(source = %entry.source, frame, %payload, "{}", entry.message)
            }
            LogLevel::Warn => {
                tracing::warn!(source = %entry.source, frame, %payload, "{}", entry.message)
            }
            LogLevel::Error | LogLevel::Fatal => {
                tracing::error!(source = %entry.source, frame, %payload, "{}", entry.message)
            }
        }
    }
}

/// Collects entries in memory for inspection.
pub struct MemorySink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().clone()
    }

    /// Entries at or above `level`.
    pub fn at_least(&self, level: LogLevel) -> Vec<LogEntry> {
        self.lock()
            .iter()
            .filter(|e| e.level >= level)
            .cloned()
            .collect()
    }

    /// Entries recorded against frame `sequence`.
    pub fn for_frame(&self, sequence: u64) -> Vec<LogEntry> {
        self.lock()
            .iter()
            .filter(|e| e.frame == Some(sequence))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for MemorySink {
    fn write(&self, entry: &LogEntry) {
        self.lock().push(entry.clone());
    }
}
