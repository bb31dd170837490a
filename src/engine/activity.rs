//! Bounded in-memory activity log surfaced through the status query.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Maximum retained entries; newest evict oldest.
pub const DEFAULT_ACTIVITY_CAP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: i64,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug)]
pub struct ActivityLog {
    entries: VecDeque<ActivityEntry>,
    cap: usize,
}

/// Shared handle written by the scheduler, executor, and stream consumer.
pub type SharedActivityLog = Arc<Mutex<ActivityLog>>;

impl ActivityLog {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn shared() -> SharedActivityLog {
        Arc::new(Mutex::new(Self::new(DEFAULT_ACTIVITY_CAP)))
    }

    pub fn push(&mut self, severity: Severity, message: impl Into<String>) {
        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(ActivityEntry {
            timestamp: chrono::Utc::now().timestamp_millis(),
            message: message.into(),
            severity,
        });
    }

    /// Snapshot, oldest first.
    pub fn snapshot(&self) -> Vec<ActivityEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Push into a shared log, tolerating a poisoned lock.
pub fn log_activity(log: &SharedActivityLog, severity: Severity, message: impl Into<String>) {
    if let Ok(mut guard) = log.lock() {
        guard.push(severity, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_entries_evict_oldest_beyond_cap() {
        let mut log = ActivityLog::new(3);

        for i in 0..5 {
            log.push(Severity::Info, format!("event {i}"));
        }

        let entries = log.snapshot();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "event 2");
        assert_eq!(entries[2].message, "event 4");
    }

    #[test]
    fn severity_round_trips_through_serde() {
        let entry = ActivityEntry {
            timestamp: 1,
            message: "warned".to_string(),
            severity: Severity::Warning,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"warning\""));
    }
}
