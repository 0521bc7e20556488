//! Per-resource metric baselines
//!
//! Maintains rolling mean/stddev for each `(resource, metric)` pair and
//! classifies deviations by z-score. Anomaly output is suppressed until a
//! minimum sample count is reached.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Default rolling window (24 hours)
const DEFAULT_WINDOW_SECS: u64 = 24 * 60 * 60;

/// Default minimum samples before anomalies are reported
const DEFAULT_MIN_SAMPLES: usize = 10;

/// Summary of one baseline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselinePoint {
    pub resource_key: String,
    pub metric: String,
    pub mean: f64,
    pub std_dev: f64,
    pub sample_count: u64,
    pub updated_at: DateTime<Utc>,
}

/// Severity of a baseline deviation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Watch,
    Warning,
    Critical,
}

/// A metric value deviating from its baseline
#[derive(Debug, Clone)]
pub struct BaselineAnomaly {
    pub resource_key: String,
    pub metric: String,
    pub current: f64,
    pub expected: f64,
    pub z_score: f64,
    pub severity: AnomalySeverity,
}

#[derive(Debug)]
struct Rolling {
    mean: f64,
    std_dev: f64,
    samples: VecDeque<(i64, f64)>,
    updated_at: DateTime<Utc>,
}

impl Rolling {
    fn new() -> Self {
        Self {
            mean: 0.0,
            std_dev: 0.0,
            samples: VecDeque::new(),
            updated_at: Utc::now(),
        }
    }

    fn add(&mut self, timestamp: i64, value: f64, window_secs: i64) {
        let cutoff = timestamp - window_secs;
        while let Some((ts, _)) = self.samples.front() {
            if *ts < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.push_back((timestamp, value));
        self.recalculate();
        self.updated_at = Utc::now();
    }

    fn recalculate(&mut self) {
        let count = self.samples.len();
        if count == 0 {
            self.mean = 0.0;
            self.std_dev = 0.0;
            return;
        }

        let sum: f64 = self.samples.iter().map(|(_, v)| v).sum();
        self.mean = sum / count as f64;

        if count > 1 {
            let variance: f64 = self
                .samples
                .iter()
                .map(|(_, v)| (v - self.mean).powi(2))
                .sum::<f64>()
                / (count - 1) as f64;
            self.std_dev = variance.sqrt();
        } else {
            self.std_dev = 0.0;
        }
    }
}

/// Rolling baselines for all tracked `(resource, metric)` pairs
pub struct BaselineStore {
    baselines: DashMap<(String, String), Rolling>,
    window: Duration,
    min_samples: usize,
    z_threshold: f64,
}

impl BaselineStore {
    pub fn new() -> Self {
        Self {
            baselines: DashMap::new(),
            window: Duration::from_secs(DEFAULT_WINDOW_SECS),
            min_samples: DEFAULT_MIN_SAMPLES,
            z_threshold: 3.0,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.min_samples = min_samples;
        self
    }

    /// Fold a new observation into the baseline
    pub fn record_sample(&self, resource_key: &str, metric: &str, timestamp: i64, value: f64) {
        let key = (resource_key.to_string(), metric.to_string());
        let mut entry = self.baselines.entry(key).or_insert_with(Rolling::new);
        entry.add(timestamp, value, self.window.as_secs() as i64);
    }

    /// Classify a value against its baseline. `None` when the baseline has
    /// too few samples, no variance, or the value is within bounds.
    pub fn check(&self, resource_key: &str, metric: &str, value: f64) -> Option<BaselineAnomaly> {
        let key = (resource_key.to_string(), metric.to_string());
        let rolling = self.baselines.get(&key)?;

        if rolling.samples.len() < self.min_samples {
            return None;
        }
        if rolling.std_dev < f64::EPSILON {
            return None;
        }

        let z_score = (value - rolling.mean) / rolling.std_dev;
        if z_score <= self.z_threshold {
            return None;
        }

        let severity = if z_score >= 5.0 {
            AnomalySeverity::Critical
        } else if z_score >= 4.0 {
            AnomalySeverity::Warning
        } else {
            AnomalySeverity::Watch
        };

        Some(BaselineAnomaly {
            resource_key: resource_key.to_string(),
            metric: metric.to_string(),
            current: value,
            expected: rolling.mean,
            z_score,
            severity,
        })
    }

    /// Current baseline summary for a pair, if tracked
    pub fn point(&self, resource_key: &str, metric: &str) -> Option<BaselinePoint> {
        let key = (resource_key.to_string(), metric.to_string());
        let rolling = self.baselines.get(&key)?;
        Some(BaselinePoint {
            resource_key: resource_key.to_string(),
            metric: metric.to_string(),
            mean: rolling.mean,
            std_dev: rolling.std_dev,
            sample_count: rolling.samples.len() as u64,
            updated_at: rolling.updated_at,
        })
    }

    /// All baselines that have reached the sample gate
    pub fn established_points(&self) -> Vec<BaselinePoint> {
        self.baselines
            .iter()
            .filter(|e| e.value().samples.len() >= self.min_samples)
            .map(|e| BaselinePoint {
                resource_key: e.key().0.clone(),
                metric: e.key().1.clone(),
                mean: e.value().mean,
                std_dev: e.value().std_dev,
                sample_count: e.value().samples.len() as u64,
                updated_at: e.value().updated_at,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }
}

impl Default for BaselineStore {
    fn default() -> Self {
        Self::new()
    }
}
