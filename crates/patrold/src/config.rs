//! Daemon configuration

use anyhow::Result;
use serde::Deserialize;

/// Patrol daemon configuration, loaded from `PATROL_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Instance label carried in logs and findings
    #[serde(default = "default_instance")]
    pub instance: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Scheduled patrol interval in seconds
    #[serde(default = "default_patrol_interval")]
    pub patrol_interval_secs: u64,

    /// Per-LLM-call timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub llm_timeout_secs: u64,

    /// Auto-apply low-risk runbooks
    #[serde(default)]
    pub auto_fix: bool,

    /// Accept event-driven patrol triggers
    #[serde(default = "default_true")]
    pub event_triggers: bool,

    /// Threshold mode: "exact" or "proactive"
    #[serde(default = "default_threshold_mode")]
    pub threshold_mode: String,

    /// Directory for persisted findings and run history
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Path to the platform-maintained state snapshot
    #[serde(default = "default_state_file")]
    pub state_file: String,

    /// Alert thresholds in percent
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f64,
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f64,
    #[serde(default = "default_disk_threshold")]
    pub disk_threshold: f64,
    #[serde(default = "default_storage_threshold")]
    pub storage_threshold: f64,
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "patrol".to_string())
}

fn default_api_port() -> u16 {
    8484
}

fn default_patrol_interval() -> u64 {
    30 * 60
}

fn default_llm_timeout() -> u64 {
    45
}

fn default_true() -> bool {
    true
}

fn default_threshold_mode() -> String {
    "exact".to_string()
}

fn default_data_dir() -> String {
    "/var/lib/patrold".to_string()
}

fn default_state_file() -> String {
    "/var/lib/patrold/state.json".to_string()
}

fn default_cpu_threshold() -> f64 {
    85.0
}

fn default_memory_threshold() -> f64 {
    85.0
}

fn default_disk_threshold() -> f64 {
    90.0
}

fn default_storage_threshold() -> f64 {
    85.0
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            instance: default_instance(),
            api_port: default_api_port(),
            patrol_interval_secs: default_patrol_interval(),
            llm_timeout_secs: default_llm_timeout(),
            auto_fix: false,
            event_triggers: true,
            threshold_mode: default_threshold_mode(),
            data_dir: default_data_dir(),
            state_file: default_state_file(),
            cpu_threshold: default_cpu_threshold(),
            memory_threshold: default_memory_threshold(),
            disk_threshold: default_disk_threshold(),
            storage_threshold: default_storage_threshold(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("PATROL"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.api_port, 8484);
        assert_eq!(config.patrol_interval_secs, 1800);
        assert_eq!(config.threshold_mode, "exact");
        assert!(config.event_triggers);
        assert!(!config.auto_fix);
    }
}
