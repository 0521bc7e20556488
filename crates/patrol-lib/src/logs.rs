//! Change and remediation logs
//!
//! Bounded append-only logs consulted for auto-fix cooldowns and for seed
//! context. Both trim oldest-first on insert.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::Duration;

/// Default cap on retained entries per log
const DEFAULT_MAX_ENTRIES: usize = 500;

/// An observed infrastructure change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub resource_id: String,
    pub change_type: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

/// Bounded append-only log of infrastructure changes
pub struct ChangeLog {
    entries: RwLock<VecDeque<ChangeEntry>>,
    max_entries: usize,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            max_entries,
        }
    }

    pub fn record(&self, entry: ChangeEntry) {
        let mut entries = self.entries.write().unwrap();
        entries.push_back(entry);
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    /// Most recent entries, newest first
    pub fn recent(&self, limit: usize) -> Vec<ChangeEntry> {
        let entries = self.entries.read().unwrap();
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Entries for one resource, newest first
    pub fn entries_for(&self, resource_id: &str) -> Vec<ChangeEntry> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .rev()
            .filter(|e| e.resource_id == resource_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

impl Default for ChangeLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome label of a remediation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemediationResult {
    Resolved,
    Partial,
    Failed,
    Unknown,
}

impl std::fmt::Display for RemediationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemediationResult::Resolved => write!(f, "resolved"),
            RemediationResult::Partial => write!(f, "partial"),
            RemediationResult::Failed => write!(f, "failed"),
            RemediationResult::Unknown => write!(f, "unknown"),
        }
    }
}

/// One remediation attempt against a finding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationEntry {
    pub finding_id: String,
    pub resource_id: String,
    pub runbook_id: String,
    pub result: RemediationResult,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

/// Bounded append-only log of remediation attempts
pub struct RemediationLog {
    entries: RwLock<VecDeque<RemediationEntry>>,
    max_entries: usize,
}

impl RemediationLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            max_entries,
        }
    }

    pub fn record(&self, entry: RemediationEntry) {
        let mut entries = self.entries.write().unwrap();
        entries.push_back(entry);
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    /// Whether any attempt against the finding happened within the window.
    /// Auto-fix uses this as its cooldown gate.
    pub fn attempted_within(&self, finding_id: &str, window: Duration) -> bool {
        let cutoff =
            Utc::now() - ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::hours(6));
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .rev()
            .any(|e| e.finding_id == finding_id && e.timestamp >= cutoff)
    }

    /// Most recent entries, newest first
    pub fn recent(&self, limit: usize) -> Vec<RemediationEntry> {
        let entries = self.entries.read().unwrap();
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Attempts against one resource, newest first
    pub fn entries_for(&self, resource_id: &str) -> Vec<RemediationEntry> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .rev()
            .filter(|e| e.resource_id == resource_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

impl Default for RemediationLog {
    fn default() -> Self {
        Self::new()
    }
}
