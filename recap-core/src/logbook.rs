use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::events::{EventBus, ShellEvent};
use crate::history::format_timestamp;
use crate::store::{keys, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Success => "success",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: String,
}

/// User-facing log: persisted ring buffer plus a `log-message` broadcast.
#[derive(Debug, Clone)]
pub struct Logbook {
    state: StateStore,
    events: EventBus,
    capacity: usize,
    lock: Arc<Mutex<()>>,
}

impl Logbook {
    pub fn new(state: StateStore, events: EventBus, capacity: usize) -> Self {
        Self {
            state,
            events,
            capacity: capacity.max(1),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.record(LogLevel::Info, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.record(LogLevel::Success, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.record(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.record(LogLevel::Error, message);
    }

    pub fn record(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info | LogLevel::Success => tracing::info!(level = %level, "{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }
        self.persist(LogEntry {
            level,
            message: message.clone(),
            timestamp: format_timestamp(Utc::now()),
        });
        self.events.emit(ShellEvent::LogMessage { level, message });
    }

    fn persist(&self, entry: LogEntry) {
        let Ok(_guard) = self.lock.lock() else {
            return;
        };
        let result = self
            .state
            .get_or::<Vec<LogEntry>>(keys::LOGS, Vec::new())
            .and_then(|mut logs| {
                logs.push(entry);
                let overflow = logs.len().saturating_sub(self.capacity);
                logs.drain(..overflow);
                self.state.put(keys::LOGS, &logs)
            });
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to persist log entry");
        }
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        match self.state.get_or::<Vec<LogEntry>>(keys::LOGS, Vec::new()) {
            Ok(logs) => logs.into_iter().rev().take(limit).collect(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to read log entries");
                Vec::new()
            }
        }
    }
}
