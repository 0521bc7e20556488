//! External interface traits
//!
//! The engine references collaborators through narrow capability traits and
//! never owns them. A missing provider (`None` at wiring time) means the
//! corresponding feature is off.

use crate::models::{Alert, Finding, PatrolRunRecord, TokenUsage};
use crate::snapshot::StateSnapshot;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use async_trait::async_trait;

/// Source of user-configured alert thresholds, each a percentage in [0, 100]
pub trait ThresholdProvider: Send + Sync {
    fn node_cpu_threshold(&self) -> f64;
    fn node_memory_threshold(&self) -> f64;
    fn guest_cpu_threshold(&self) -> f64;
    fn guest_memory_threshold(&self) -> f64;
    fn guest_disk_threshold(&self) -> f64;
    fn storage_threshold(&self) -> f64;
}

/// Source of the current infrastructure inventory snapshot
#[async_trait]
pub trait StateProvider: Send + Sync {
    async fn get_state(&self) -> Result<StateSnapshot>;
}

/// Where a remote command runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    /// The agent's own host (the node running the agent)
    Host,
    /// Exec inside a VM guest
    Vm,
    /// Exec inside a container guest
    Container,
}

/// A command submitted to a connected agent
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    pub target: TargetType,
    /// VMID for guest targets; ignored for host targets
    pub vmid: Option<u32>,
    pub timeout: Duration,
    pub env: HashMap<String, String>,
}

impl CommandRequest {
    pub fn host(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            target: TargetType::Host,
            vmid: None,
            timeout: Duration::from_secs(30),
            env: HashMap::new(),
        }
    }

    pub fn guest(command: impl Into<String>, target: TargetType, vmid: u32) -> Self {
        Self {
            command: command.into(),
            target,
            vmid: Some(vmid),
            timeout: Duration::from_secs(30),
            env: HashMap::new(),
        }
    }
}

/// Result of a remote command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOutcome {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Executes commands on connected agents
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute_command(&self, agent_id: &str, req: CommandRequest) -> Result<CommandOutcome>;
}

/// Read-only view of the alert manager
#[async_trait]
pub trait AlertManagerAdapter: Send + Sync {
    async fn active_alerts(&self) -> Vec<Alert>;
    async fn alerts_by_resource(&self, resource_id: &str) -> Vec<Alert>;
    async fn recently_resolved(&self, minutes: u32) -> Vec<Alert>;
    async fn alert_history(&self, resource_id: &str, count: usize) -> Vec<Alert>;
}

/// Persistence port for patrol run history. Errors are non-fatal to callers.
#[async_trait]
pub trait HistoryPersistence: Send + Sync {
    async fn save_run_history(&self, records: &[PatrolRunRecord]) -> Result<()>;
    async fn load_run_history(&self) -> Result<Vec<PatrolRunRecord>>;
}

/// Persistence port for findings. Errors are non-fatal to callers.
#[async_trait]
pub trait FindingsPersistence: Send + Sync {
    async fn save_findings(&self, findings: &[Finding]) -> Result<()>;
    async fn load_findings(&self) -> Result<Vec<Finding>>;
}

/// One message in a chat exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Chat request handed to the LLM provider
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Preferred model; empty lets the provider choose
    pub model: String,
    pub max_tokens: Option<u32>,
}

/// Chat response from the LLM provider
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
}

/// LLM provider capability
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse>;
    async fn test_connection(&self) -> Result<()>;
    fn name(&self) -> &str;
    async fn list_models(&self) -> Result<Vec<String>>;
    /// Context window of the configured model, when known
    fn context_window(&self) -> Option<u32> {
        None
    }
}

/// Fixed alert thresholds, used when no live provider is wired and in tests
#[derive(Debug, Clone, Copy)]
pub struct StaticThresholds {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub storage: f64,
}

impl Default for StaticThresholds {
    fn default() -> Self {
        Self {
            cpu: 85.0,
            memory: 85.0,
            disk: 90.0,
            storage: 85.0,
        }
    }
}

impl ThresholdProvider for StaticThresholds {
    fn node_cpu_threshold(&self) -> f64 {
        self.cpu
    }
    fn node_memory_threshold(&self) -> f64 {
        self.memory
    }
    fn guest_cpu_threshold(&self) -> f64 {
        self.cpu
    }
    fn guest_memory_threshold(&self) -> f64 {
        self.memory
    }
    fn guest_disk_threshold(&self) -> f64 {
        self.disk
    }
    fn storage_threshold(&self) -> f64 {
        self.storage
    }
}

/// One historical metric observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    pub resource_id: String,
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Read-only access to recent metric history for seed context
#[async_trait]
pub trait MetricsHistoryProvider: Send + Sync {
    async fn recent_points(&self, resource_id: &str, metric: &str, limit: usize)
        -> Vec<MetricPoint>;
}

/// Narrow capability the runbook executor and investigation orchestrator use
/// to resolve findings after a verified fix. The engine implements this.
#[async_trait]
pub trait FindingResolver: Send + Sync {
    async fn resolve_finding(&self, finding_id: &str, note: &str) -> bool;
}
