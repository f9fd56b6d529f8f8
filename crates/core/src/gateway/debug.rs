use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugEntry {
    pub ts: i64,
    pub kind: String,
    pub data: Value,
}

/// Bounded in-memory ring of recent gateway traffic.
#[derive(Debug)]
pub struct DebugLog {
    entries: Mutex<VecDeque<DebugEntry>>,
    limit: usize,
}

impl DebugLog {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(limit.min(1024))),
            limit: limit.max(1),
        }
    }

    pub fn push(&self, kind: impl Into<String>, data: Value) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.push_back(DebugEntry {
            ts: Utc::now().timestamp_millis(),
            kind: kind.into(),
            data,
        });
        while entries.len() > self.limit {
            entries.pop_front();
        }
    }

    /// Newest last; at most `limit` entries.
    pub fn recent(&self, limit: Option<usize>) -> Vec<DebugEntry> {
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let take = limit.unwrap_or(entries.len()).min(entries.len());
        entries.iter().skip(entries.len() - take).cloned().collect()
    }
}
