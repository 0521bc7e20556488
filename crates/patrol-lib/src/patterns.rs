//! Recurrent failure patterns
//!
//! Tracks failure-class events per resource and surfaces patterns that
//! repeat at roughly regular intervals. Patterns feed predictive findings
//! ("this guest OOMs about every 6 hours") and seed context.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

/// Default cap on retained occurrences per (resource, kind)
const DEFAULT_MAX_OCCURRENCES: usize = 50;

/// Default minimum recurrences before a pattern is reported
const DEFAULT_MIN_RECURRENCES: usize = 3;

/// Default lookback for pattern detection (7 days)
const DEFAULT_LOOKBACK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// One recorded failure occurrence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEvent {
    pub resource_id: String,
    pub resource_name: String,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
}

/// A recurring failure pattern on one resource
#[derive(Debug, Clone)]
pub struct FailurePattern {
    pub resource_id: String,
    pub resource_name: String,
    pub kind: String,
    pub occurrences: usize,
    pub avg_interval: Duration,
    /// Expected next occurrence, projected from the last event
    pub next_expected: DateTime<Utc>,
}

/// Detects recurring failures per resource
pub struct PatternDetector {
    events: RwLock<HashMap<(String, String), VecDeque<FailureEvent>>>,
    max_occurrences: usize,
    min_recurrences: usize,
    lookback: ChronoDuration,
}

impl PatternDetector {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MAX_OCCURRENCES, DEFAULT_MIN_RECURRENCES, DEFAULT_LOOKBACK)
    }

    pub fn with_config(max_occurrences: usize, min_recurrences: usize, lookback: Duration) -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            max_occurrences,
            min_recurrences,
            lookback: ChronoDuration::from_std(lookback).unwrap_or_else(|_| ChronoDuration::days(7)),
        }
    }

    /// Record a failure occurrence
    pub fn record_failure(&self, event: FailureEvent) {
        let key = (event.resource_id.clone(), event.kind.clone());
        let mut events = self.events.write().unwrap();
        let queue = events.entry(key).or_default();
        queue.push_back(event);
        while queue.len() > self.max_occurrences {
            queue.pop_front();
        }
    }

    /// Patterns that recur at least `min_recurrences` times within the lookback
    pub fn patterns(&self) -> Vec<FailurePattern> {
        let cutoff = Utc::now() - self.lookback;
        let events = self.events.read().unwrap();

        let mut out: Vec<FailurePattern> = events
            .values()
            .filter_map(|queue| {
                let recent: Vec<&FailureEvent> =
                    queue.iter().filter(|e| e.timestamp >= cutoff).collect();
                if recent.len() < self.min_recurrences.max(2) {
                    return None;
                }

                let total_gap: ChronoDuration = recent
                    .windows(2)
                    .map(|pair| pair[1].timestamp - pair[0].timestamp)
                    .fold(ChronoDuration::zero(), |acc, d| acc + d);
                let avg_gap = total_gap / (recent.len() - 1) as i32;
                let last = recent.last().expect("non-empty");

                Some(FailurePattern {
                    resource_id: last.resource_id.clone(),
                    resource_name: last.resource_name.clone(),
                    kind: last.kind.clone(),
                    occurrences: recent.len(),
                    avg_interval: avg_gap.to_std().unwrap_or(Duration::ZERO),
                    next_expected: last.timestamp + avg_gap,
                })
            })
            .collect();

        out.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));
        out
    }

    /// Patterns for one resource
    pub fn patterns_for(&self, resource_id: &str) -> Vec<FailurePattern> {
        self.patterns()
            .into_iter()
            .filter(|p| p.resource_id == resource_id)
            .collect()
    }

    /// Human-readable pattern lines for the seed
    pub fn format_for_context(&self, limit: usize) -> String {
        let patterns = self.patterns();
        if patterns.is_empty() {
            return String::new();
        }
        patterns
            .iter()
            .take(limit)
            .map(|p| {
                format!(
                    "{} recurs on {}: {} occurrences, roughly every {}",
                    p.kind,
                    p.resource_name,
                    p.occurrences,
                    crate::correlation::humanize_delay(p.avg_interval)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure_at(resource: &str, kind: &str, hours_ago: i64) -> FailureEvent {
        FailureEvent {
            resource_id: resource.to_string(),
            resource_name: resource.rsplit('/').next().unwrap_or(resource).to_string(),
            kind: kind.to_string(),
            timestamp: Utc::now() - ChronoDuration::hours(hours_ago),
        }
    }

    #[test]
    fn test_pattern_requires_min_recurrences() {
        let detector = PatternDetector::new();
        detector.record_failure(failure_at("vm/101", "oom", 12));
        detector.record_failure(failure_at("vm/101", "oom", 6));

        assert!(detector.patterns().is_empty());

        detector.record_failure(failure_at("vm/101", "oom", 0));
        let patterns = detector.patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].occurrences, 3);
    }

    #[test]
    fn test_avg_interval_and_projection() {
        let detector = PatternDetector::new();
        for hours_ago in [18, 12, 6, 0] {
            detector.record_failure(failure_at("vm/101", "oom", hours_ago));
        }

        let pattern = &detector.patterns()[0];
        let six_hours = Duration::from_secs(6 * 3600);
        assert!(pattern.avg_interval >= six_hours - Duration::from_secs(5));
        assert!(pattern.avg_interval <= six_hours + Duration::from_secs(5));
        assert!(pattern.next_expected > Utc::now());
    }

    #[test]
    fn test_old_events_outside_lookback_ignored() {
        let detector =
            PatternDetector::with_config(50, 3, Duration::from_secs(24 * 3600));
        for hours_ago in [100, 80, 60] {
            detector.record_failure(failure_at("vm/101", "oom", hours_ago));
        }

        assert!(detector.patterns().is_empty());
    }

    #[test]
    fn test_distinct_kinds_tracked_separately() {
        let detector = PatternDetector::new();
        for hours_ago in [12, 6, 0] {
            detector.record_failure(failure_at("vm/101", "oom", hours_ago));
            detector.record_failure(failure_at("vm/101", "restart-loop", hours_ago));
        }

        let patterns = detector.patterns_for("vm/101");
        assert_eq!(patterns.len(), 2);
    }

    #[test]
    fn test_format_for_context() {
        let detector = PatternDetector::new();
        for hours_ago in [12, 6, 0] {
            detector.record_failure(failure_at("vm/101", "oom", hours_ago));
        }

        let text = detector.format_for_context(5);
        assert!(text.contains("oom recurs on 101"));
        assert!(text.contains("3 occurrences"));
    }
}
