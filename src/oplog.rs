//! # Operational Log
//!
//! Bounded, FIFO-evicting ring buffer of diagnostic entries.
//!
//! Every component logs through [`OperationalLog`]. Entries are stored as-is
//! (level, message, timestamp) and mirrored to `tracing` so they also reach the
//! process log. The buffer holds at most [`LOG_CAPACITY`] entries; the oldest
//! entry is evicted first.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Hard capacity of the operational log
pub const LOG_CAPACITY: usize = 500;

/// Buffered entries for live log subscribers
const LOG_CHANNEL_CAPACITY: usize = 64;

/// Severity of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// A single diagnostic entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

struct LogInner {
    entries: Mutex<VecDeque<LogEntry>>,
    live: broadcast::Sender<LogEntry>,
}

/// Shared handle to the operational log
///
/// Cloning is cheap; all clones append to the same buffer.
#[derive(Clone)]
pub struct OperationalLog {
    inner: Arc<LogInner>,
}

impl fmt::Debug for OperationalLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationalLog")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl Default for OperationalLog {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationalLog {
    /// Create an empty log
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(LogInner {
                entries: Mutex::new(VecDeque::with_capacity(LOG_CAPACITY)),
                live,
            }),
        }
    }

    /// Append an entry, evicting the oldest one when the log is full
    pub fn append(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        };

        match level {
            LogLevel::Debug => debug!("{}", entry.message),
            LogLevel::Info => info!("{}", entry.message),
            LogLevel::Warn => warn!("{}", entry.message),
            LogLevel::Error => error!("{}", entry.message),
        }

        {
            let mut entries = self.inner.entries.lock();
            while entries.len() >= LOG_CAPACITY {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }

        // No receivers is the normal case
        let _ = self.inner.live.send(entry);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.append(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.append(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.append(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.append(LogLevel::Error, message);
    }

    /// Snapshot of all entries, oldest first
    pub fn get_all(&self) -> Vec<LogEntry> {
        self.inner.entries.lock().iter().cloned().collect()
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.inner.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    /// Receive entries as they are appended
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.inner.live.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_get_all() {
        let log = OperationalLog::new();
        log.info("scan started");
        log.warn("weak signal");

        let entries = log.get_all();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, LogLevel::Info);
        assert_eq!(entries[0].message, "scan started");
        assert_eq!(entries[1].level, LogLevel::Warn);
    }

    #[test]
    fn test_capacity_is_never_exceeded() {
        let log = OperationalLog::new();
        for i in 0..(LOG_CAPACITY * 3) {
            log.debug(format!("entry {}", i));
            assert!(log.len() <= LOG_CAPACITY);
        }
        assert_eq!(log.len(), LOG_CAPACITY);
    }

    #[test]
    fn test_fifo_eviction_after_501_appends() {
        let log = OperationalLog::new();
        for i in 1..=501 {
            log.info(format!("entry {}", i));
        }

        let entries = log.get_all();
        assert_eq!(entries.len(), 500);
        assert!(!entries.iter().any(|e| e.message == "entry 1"));
        assert_eq!(entries[0].message, "entry 2");
        assert_eq!(entries[499].message, "entry 501");
    }

    #[test]
    fn test_clear() {
        let log = OperationalLog::new();
        log.error("boom");
        assert!(!log.is_empty());

        log.clear();
        assert!(log.is_empty());
        assert!(log.get_all().is_empty());
    }

    #[test]
    fn test_clones_share_buffer() {
        let log = OperationalLog::new();
        let other = log.clone();
        other.info("from clone");
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_receives_new_entries() {
        let log = OperationalLog::new();
        let mut rx = log.subscribe();

        log.warn("link lost");

        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.level, LogLevel::Warn);
        assert_eq!(entry.message, "link lost");
    }

    #[test]
    fn test_level_display() {
        assert_eq!(LogLevel::Info.to_string(), "INFO");
        assert_eq!(LogLevel::Error.to_string(), "ERROR");
    }
}
