//! Per-model consecutive load failure counts.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::catalog::name_key;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureEntry {
    pub count: u32,
    pub last_error: String,
    pub last_failure: DateTime<Utc>,
}

/// Keyed by normalized model name. Only the orchestrator mutates it.
pub struct FailureLedger {
    entries: DashMap<String, FailureEntry>,
}

impl FailureLedger {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Count one failed load. Returns the new count.
    pub(crate) fn record_failure(&self, name: &str, error: &str) -> u32 {
        let mut entry = self
            .entries
            .entry(name_key(name))
            .or_insert_with(|| FailureEntry {
                count: 0,
                last_error: String::new(),
                last_failure: Utc::now(),
            });
        entry.count = entry.count.saturating_add(1);
        entry.last_error = error.to_string();
        entry.last_failure = Utc::now();
        entry.count
    }

    pub(crate) fn reset(&self, name: &str) {
        self.entries.remove(&name_key(name));
    }

    pub fn count(&self, name: &str) -> u32 {
        self.entries
            .get(&name_key(name))
            .map(|e| e.count)
            .unwrap_or(0)
    }

    pub fn get(&self, name: &str) -> Option<FailureEntry> {
        self.entries.get(&name_key(name)).map(|e| e.clone())
    }

    pub fn is_exhausted(&self, name: &str, max_attempts: u32) -> bool {
        self.count(name) >= max_attempts
    }

    /// All entries, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, FailureEntry)> {
        let mut all: Vec<(String, FailureEntry)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

impl Default for FailureLedger {
    fn default() -> Self {
        Self::new()
    }
}
