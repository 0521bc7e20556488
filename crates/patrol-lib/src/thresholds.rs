//! Patrol threshold bands
//!
//! Derives watch/warning/critical bands from the user's alert thresholds.
//! Exact mode places the warning band at the alert threshold itself;
//! proactive mode shifts the disk and storage bands below the alert
//! threshold so patrols flag resources before alerts fire.

use crate::providers::ThresholdProvider;
use serde::{Deserialize, Serialize};

/// Bands are kept inside this range regardless of the alert thresholds
const BAND_MIN: f64 = 10.0;
const BAND_MAX: f64 = 99.0;

/// How bands relate to the alert thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdMode {
    /// Bands bracket the alert threshold
    #[default]
    Exact,
    /// Disk/storage bands sit below the alert threshold
    Proactive,
}

/// Watch/warning band pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Band {
    pub watch: f64,
    pub warning: f64,
}

/// Watch/warning/critical band triple
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BandWithCritical {
    pub watch: f64,
    pub warning: f64,
    pub critical: f64,
}

/// Derived patrol thresholds, all percentages clamped to [10, 99]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct PatrolThresholds {
    pub node_cpu: Band,
    pub node_memory: Band,
    pub guest_memory: Band,
    pub guest_disk: BandWithCritical,
    pub storage: BandWithCritical,
    pub mode: ThresholdMode,
}

fn clamp_band(value: f64) -> f64 {
    value.clamp(BAND_MIN, BAND_MAX)
}

fn pair(alert: f64) -> Band {
    Band {
        watch: clamp_band(alert - 5.0),
        warning: clamp_band(alert),
    }
}

fn triple(alert: f64, mode: ThresholdMode) -> BandWithCritical {
    match mode {
        ThresholdMode::Exact => BandWithCritical {
            watch: clamp_band(alert - 5.0),
            warning: clamp_band(alert),
            critical: clamp_band(alert + 5.0),
        },
        ThresholdMode::Proactive => BandWithCritical {
            watch: clamp_band(alert - 15.0),
            warning: clamp_band(alert - 5.0),
            critical: clamp_band(alert - 3.0),
        },
    }
}

impl PatrolThresholds {
    /// Derive bands from the provider's current alert thresholds.
    ///
    /// Re-deriving produces a fresh value; existing findings are never
    /// retroactively mutated by a mode change.
    pub fn derive(provider: &dyn ThresholdProvider, mode: ThresholdMode) -> Self {
        Self {
            node_cpu: pair(provider.node_cpu_threshold()),
            node_memory: pair(provider.node_memory_threshold()),
            guest_memory: pair(provider.guest_memory_threshold()),
            guest_disk: triple(provider.guest_disk_threshold(), mode),
            storage: triple(provider.storage_threshold(), mode),
            mode,
        }
    }

    /// Watch threshold applicable to a metric name on a resource type.
    /// Used when validating metric values claimed by parsed findings.
    pub fn watch_for(&self, resource_type: &str, metric: &str) -> Option<f64> {
        match (resource_type, metric) {
            ("node", "cpu") => Some(self.node_cpu.watch),
            ("node", "memory") => Some(self.node_memory.watch),
            ("vm", "memory") | ("container", "memory") => Some(self.guest_memory.watch),
            ("vm", "disk") | ("container", "disk") => Some(self.guest_disk.watch),
            ("storage", "usage") | ("storage", "disk") => Some(self.storage.watch),
            _ => None,
        }
    }
}
