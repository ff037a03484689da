use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::orchestrator::{LogEntry, timestamp_order};

/// Maximum number of entries kept in the buffer.
pub const LOG_LIMIT: usize = 200;

const UNKNOWN_RUN: &str = "unknown";

/// Identity of a log event: owning run, timestamp, message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogKey {
    run_id: String,
    timestamp: String,
    message: String,
}

impl LogKey {
    pub fn of(entry: &LogEntry) -> Self {
        Self {
            run_id: entry.flow_run_id.clone().unwrap_or_else(|| UNKNOWN_RUN.to_string()),
            timestamp: entry.timestamp.clone(),
            message: entry.message.clone(),
        }
    }
}

/// Append-only, deduplicating log buffer bounded to [`LOG_LIMIT`] entries.
///
/// Order is merge order, not timestamp order. Eviction drops the oldest merged
/// entries first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogBuffer {
    entries: Vec<LogEntry>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        let mut buffer = Self::new();
        buffer.replace(entries);
        buffer
    }

    /// Merge `new_entries`, skipping any whose key is already present (including
    /// duplicates inside `new_entries` itself). Returns how many were added.
    pub fn append(&mut self, new_entries: &[LogEntry]) -> usize {
        if new_entries.is_empty() {
            return 0;
        }

        let mut seen: HashSet<LogKey> = self.entries.iter().map(LogKey::of).collect();
        let before = self.entries.len();
        for entry in new_entries {
            if seen.insert(LogKey::of(entry)) {
                self.entries.push(entry.clone());
            }
        }
        let added = self.entries.len() - before;
        self.trim();
        added
    }

    /// Overwrite the buffer with `entries`, keeping the last [`LOG_LIMIT`].
    pub fn replace(&mut self, entries: Vec<LogEntry>) {
        self.entries = entries;
        self.trim();
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Latest timestamp in the buffer, used to resume incremental fetching.
    pub fn last_timestamp(&self) -> Option<&str> {
        self.entries
            .iter()
            .map(|e| e.timestamp.as_str())
            .max_by(|a, b| timestamp_order(a, b))
    }

    /// Distinct owning run ids, in first-seen order.
    pub fn run_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for id in self.entries.iter().filter_map(|e| e.flow_run_id.as_ref()) {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    fn trim(&mut self) {
        if self.entries.len() > LOG_LIMIT {
            let excess = self.entries.len() - LOG_LIMIT;
            self.entries.drain(..excess);
        }
    }
}
