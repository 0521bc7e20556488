//! Temporal event correlation
//!
//! Records resource events in a bounded window and surfaces pairs that
//! repeatedly co-occur: an event on resource A followed by an event on
//! resource B within the correlation window. Supports cascade prediction
//! (given an event, which resources tend to follow) and feeds the scope
//! resolver's correlation-driven expansion.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

/// Default cap on buffered events
const DEFAULT_MAX_EVENTS: usize = 5_000;

/// Default window within which two events count as correlated
const DEFAULT_CORRELATION_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Default retention for buffered events
const DEFAULT_RETENTION_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Default occurrences before a pair is reported
const DEFAULT_MIN_OCCURRENCES: usize = 3;

/// One observed event on a resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationEvent {
    pub resource_id: String,
    pub resource_name: String,
    pub resource_type: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
}

/// A statistically supported source → target association
#[derive(Debug, Clone)]
pub struct Correlation {
    pub source_resource_id: String,
    pub source_resource_name: String,
    pub source_event: String,
    pub target_resource_id: String,
    pub target_resource_name: String,
    pub target_event: String,
    pub occurrences: usize,
    pub avg_delay: Duration,
    /// occurrences / total events seen from the source
    pub confidence: f64,
}

/// A predicted downstream effect of an event
#[derive(Debug, Clone)]
pub struct CascadePrediction {
    pub resource_id: String,
    pub resource_name: String,
    pub event_type: String,
    pub confidence: f64,
    pub typical_delay: Duration,
}

/// Render a delay the way prompts expect: seconds, minutes, or hours
pub fn humanize_delay(delay: Duration) -> String {
    let secs = delay.as_secs();
    if secs < 60 {
        "seconds".to_string()
    } else if secs < 3600 {
        format!("{} minutes", secs / 60)
    } else {
        format!("{} hours", secs / 3600)
    }
}

/// Windowed event store with pairwise correlation extraction
pub struct CorrelationDetector {
    events: RwLock<VecDeque<CorrelationEvent>>,
    max_events: usize,
    correlation_window: ChronoDuration,
    retention_window: ChronoDuration,
    min_occurrences: usize,
}

impl CorrelationDetector {
    pub fn new() -> Self {
        Self::with_config(
            DEFAULT_MAX_EVENTS,
            DEFAULT_CORRELATION_WINDOW,
            DEFAULT_RETENTION_WINDOW,
            DEFAULT_MIN_OCCURRENCES,
        )
    }

    pub fn with_config(
        max_events: usize,
        correlation_window: Duration,
        retention_window: Duration,
        min_occurrences: usize,
    ) -> Self {
        Self {
            events: RwLock::new(VecDeque::new()),
            max_events,
            correlation_window: ChronoDuration::from_std(correlation_window)
                .unwrap_or_else(|_| ChronoDuration::minutes(10)),
            retention_window: ChronoDuration::from_std(retention_window)
                .unwrap_or_else(|_| ChronoDuration::hours(24)),
            min_occurrences,
        }
    }

    /// Append an event, dropping the oldest past the cap and anything
    /// outside the retention window
    pub fn record_event(&self, event: CorrelationEvent) {
        let mut events = self.events.write().unwrap();
        let cutoff = Utc::now() - self.retention_window;
        while let Some(front) = events.front() {
            if front.timestamp < cutoff {
                events.pop_front();
            } else {
                break;
            }
        }
        while events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn event_count(&self) -> usize {
        self.events.read().unwrap().len()
    }

    /// Pairs where a source event precedes a target event within the
    /// correlation window, at least `min_occurrences` times
    pub fn correlations(&self) -> Vec<Correlation> {
        let events = self.events.read().unwrap();
        let ordered: Vec<&CorrelationEvent> = events.iter().collect();

        // (source id, source event, target id, target event) -> (count, total delay)
        let mut pairs: HashMap<(String, String, String, String), (usize, ChronoDuration, String, String)> =
            HashMap::new();
        let mut source_totals: HashMap<(String, String), usize> = HashMap::new();

        for (i, a) in ordered.iter().enumerate() {
            *source_totals
                .entry((a.resource_id.clone(), a.event_type.clone()))
                .or_insert(0) += 1;

            for b in ordered.iter().skip(i + 1) {
                let delay = b.timestamp - a.timestamp;
                if delay > self.correlation_window {
                    break;
                }
                if b.resource_id == a.resource_id {
                    continue;
                }
                let key = (
                    a.resource_id.clone(),
                    a.event_type.clone(),
                    b.resource_id.clone(),
                    b.event_type.clone(),
                );
                let entry = pairs.entry(key).or_insert((
                    0,
                    ChronoDuration::zero(),
                    a.resource_name.clone(),
                    b.resource_name.clone(),
                ));
                entry.0 += 1;
                entry.1 = entry.1 + delay;
            }
        }

        let mut out: Vec<Correlation> = pairs
            .into_iter()
            .filter(|(_, (count, _, _, _))| *count >= self.min_occurrences)
            .map(|((src_id, src_ev, dst_id, dst_ev), (count, total_delay, src_name, dst_name))| {
                let total_source = source_totals
                    .get(&(src_id.clone(), src_ev.clone()))
                    .copied()
                    .unwrap_or(count)
                    .max(count);
                let avg = (total_delay / count as i32)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                Correlation {
                    source_resource_id: src_id,
                    source_resource_name: src_name,
                    source_event: src_ev,
                    target_resource_id: dst_id,
                    target_resource_name: dst_name,
                    target_event: dst_ev,
                    occurrences: count,
                    avg_delay: avg,
                    confidence: count as f64 / total_source as f64,
                }
            })
            .collect();

        out.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));
        out
    }

    /// Predicted downstream resources for an event on a resource
    pub fn predict_cascade(&self, resource_id: &str, event_type: &str) -> Vec<CascadePrediction> {
        self.correlations()
            .into_iter()
            .filter(|c| c.source_resource_id == resource_id && c.source_event == event_type)
            .map(|c| CascadePrediction {
                resource_id: c.target_resource_id,
                resource_name: c.target_resource_name,
                event_type: c.target_event,
                confidence: c.confidence,
                typical_delay: c.avg_delay,
            })
            .collect()
    }

    /// Resources correlated with any of the given ids above the confidence
    /// floor. Used to expand a trigger-supplied patrol scope.
    pub fn correlated_resources(
        &self,
        resource_ids: &BTreeSet<String>,
        confidence_floor: f64,
    ) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for c in self.correlations() {
            if c.confidence < confidence_floor {
                continue;
            }
            if resource_ids.contains(&c.source_resource_id) {
                out.insert(c.target_resource_id.clone());
            }
            if resource_ids.contains(&c.target_resource_id) {
                out.insert(c.source_resource_id.clone());
            }
        }
        for id in resource_ids {
            out.remove(id);
        }
        out
    }

    /// Human-readable correlation lines for the seed
    pub fn format_for_context(&self, limit: usize) -> String {
        let correlations = self.correlations();
        if correlations.is_empty() {
            return String::new();
        }
        correlations
            .iter()
            .take(limit)
            .map(|c| {
                format!(
                    "{} {} -> {} {} ({}x, typically after {})",
                    c.source_resource_name,
                    c.source_event,
                    c.target_resource_name,
                    c.target_event,
                    c.occurrences,
                    humanize_delay(c.avg_delay)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for CorrelationDetector {
    fn default() -> Self {
        Self::new()
    }
}
