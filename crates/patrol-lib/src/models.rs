//! Core data model for the patrol subsystem

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};

/// Maximum length of the free-text context hint on a patrol scope
pub const SCOPE_CONTEXT_MAX: usize = 240;

/// Finding severity, ordered from least to most severe
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Watch,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Watch => write!(f, "watch"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl Severity {
    /// Parse a severity label; unknown labels map to `Watch`
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Severity::Info,
            "watch" => Severity::Watch,
            "warning" => Severity::Warning,
            "critical" => Severity::Critical,
            _ => Severity::Watch,
        }
    }
}

/// Finding category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FindingCategory {
    Performance,
    #[default]
    Reliability,
    Security,
    Capacity,
    Backup,
    Cost,
    Maintenance,
}

impl std::fmt::Display for FindingCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FindingCategory::Performance => write!(f, "performance"),
            FindingCategory::Reliability => write!(f, "reliability"),
            FindingCategory::Security => write!(f, "security"),
            FindingCategory::Capacity => write!(f, "capacity"),
            FindingCategory::Backup => write!(f, "backup"),
            FindingCategory::Cost => write!(f, "cost"),
            FindingCategory::Maintenance => write!(f, "maintenance"),
        }
    }
}

impl FindingCategory {
    /// Parse a category label; unknown labels map to `Reliability`
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "performance" => FindingCategory::Performance,
            "reliability" => FindingCategory::Reliability,
            "security" => FindingCategory::Security,
            "capacity" => FindingCategory::Capacity,
            "backup" => FindingCategory::Backup,
            "cost" => FindingCategory::Cost,
            "maintenance" => FindingCategory::Maintenance,
            _ => FindingCategory::Reliability,
        }
    }
}

/// High-level phase of a finding's remediation life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    #[default]
    Detected,
    Investigating,
    Remediating,
    Verifying,
    Resolved,
    Manual,
}

impl LoopState {
    /// Position in the detected → resolved DAG; `Manual` is terminal
    pub fn rank(&self) -> u8 {
        match self {
            LoopState::Detected => 0,
            LoopState::Investigating => 1,
            LoopState::Remediating => 2,
            LoopState::Verifying => 3,
            LoopState::Resolved => 4,
            LoopState::Manual => 4,
        }
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopState::Detected => write!(f, "detected"),
            LoopState::Investigating => write!(f, "investigating"),
            LoopState::Remediating => write!(f, "remediating"),
            LoopState::Verifying => write!(f, "verifying"),
            LoopState::Resolved => write!(f, "resolved"),
            LoopState::Manual => write!(f, "manual"),
        }
    }
}

/// Outcome of the most recent investigation of a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationOutcome {
    #[default]
    None,
    Investigating,
    Remediating,
    FixApplied,
    FixVerified,
    ManualRequired,
}

impl InvestigationOutcome {
    /// Loop state this outcome implies
    pub fn derived_loop_state(&self) -> LoopState {
        match self {
            InvestigationOutcome::None => LoopState::Detected,
            InvestigationOutcome::Investigating => LoopState::Investigating,
            InvestigationOutcome::Remediating => LoopState::Remediating,
            InvestigationOutcome::FixApplied => LoopState::Verifying,
            InvestigationOutcome::FixVerified => LoopState::Resolved,
            InvestigationOutcome::ManualRequired => LoopState::Manual,
        }
    }
}

/// Kind of a lifecycle event on a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    Detected,
    Reseen,
    Regressed,
    Resolved,
    LoopTransition,
    LoopTransitionViolation,
    InvestigationStarted,
    InvestigationCompleted,
    AutoFixApplied,
}

/// One entry in a finding's ordered lifecycle list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub kind: LifecycleEventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LifecycleEvent {
    pub fn now(kind: LifecycleEventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            detail: None,
        }
    }

    pub fn with_detail(kind: LifecycleEventKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            detail: Some(detail.into()),
        }
    }
}

/// A durable, deduplicated assertion that a condition holds on a resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// Stable content-hash identity (resource + key)
    pub id: String,
    /// Category within the resource, e.g. `high-disk`
    pub key: String,
    pub severity: Severity,
    pub category: FindingCategory,
    pub resource_id: String,
    pub resource_name: String,
    pub resource_type: String,
    pub node: String,
    pub title: String,
    pub description: String,
    pub recommendation: String,
    pub evidence: String,
    pub first_detected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub times_raised: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub regression_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_regression_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub loop_state: LoopState,
    #[serde(default)]
    pub investigation_outcome: InvestigationOutcome,
    #[serde(default)]
    pub lifecycle: Vec<LifecycleEvent>,
}

/// Stable finding identity: truncated SHA-256 over resource id and key
pub fn finding_id(resource_id: &str, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(resource_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

impl Finding {
    /// Create a fresh finding in the `Detected` state
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: impl Into<String>,
        severity: Severity,
        category: FindingCategory,
        resource_id: impl Into<String>,
        resource_name: impl Into<String>,
        resource_type: impl Into<String>,
        node: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let key = key.into();
        let resource_id = resource_id.into();
        let now = Utc::now();
        Self {
            id: finding_id(&resource_id, &key),
            key,
            severity,
            category,
            resource_id,
            resource_name: resource_name.into(),
            resource_type: resource_type.into(),
            node: node.into(),
            title: title.into(),
            description: String::new(),
            recommendation: String::new(),
            evidence: String::new(),
            first_detected_at: now,
            last_seen_at: now,
            times_raised: 1,
            resolved_at: None,
            regression_count: 0,
            last_regression_at: None,
            loop_state: LoopState::Detected,
            investigation_outcome: InvestigationOutcome::None,
            lifecycle: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_recommendation(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendation = recommendation.into();
        self
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = evidence.into();
        self
    }

    /// A finding is active until resolved
    pub fn is_active(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// What started a patrol run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PatrolType {
    #[default]
    Scheduled,
    Event,
    Manual,
}

impl std::fmt::Display for PatrolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatrolType::Scheduled => write!(f, "scheduled"),
            PatrolType::Event => write!(f, "event"),
            PatrolType::Manual => write!(f, "manual"),
        }
    }
}

/// Terminal status of a patrol run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Ok,
    IssuesFound,
    Error,
    Skipped,
}

/// Resources inspected during one run, by class
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourcesChecked {
    pub nodes: usize,
    pub guests: usize,
    pub docker_hosts: usize,
    pub storage: usize,
    pub backup: usize,
    pub mail: usize,
}

impl ResourcesChecked {
    pub fn total(&self) -> usize {
        self.nodes + self.guests + self.docker_hosts + self.storage + self.backup + self.mail
    }
}

/// AI token usage for one run
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Record of one completed patrol run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatrolRunRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub patrol_type: PatrolType,
    pub checked: ResourcesChecked,
    pub new_findings: usize,
    pub existing_findings: usize,
    pub resolved_findings: usize,
    pub rejected_findings: usize,
    pub auto_fixes: usize,
    pub findings_summary: String,
    pub finding_ids: Vec<String>,
    pub status: RunStatus,
    pub usage: TokenUsage,
    pub model: String,
    pub error_count: usize,
}

/// How deeply a scoped patrol should look
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScopeDepth {
    Shallow,
    #[default]
    Normal,
    Deep,
}

/// Subset of resources a patrol run is limited to
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatrolScope {
    pub resource_ids: BTreeSet<String>,
    pub resource_types: BTreeSet<String>,
    pub depth: ScopeDepth,
    /// The triggering event, e.g. `alert_fired:high-memory`
    pub reason: String,
    /// Free-text hint carried into the seed
    pub context: String,
}

impl PatrolScope {
    /// Drop empty entries, trim whitespace, and ellipsize the context hint.
    /// Returns `false` when nothing remains to scope to.
    pub fn normalize(&mut self) -> bool {
        self.resource_ids = self
            .resource_ids
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        self.resource_types = self
            .resource_types
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if self.context.chars().count() > SCOPE_CONTEXT_MAX {
            let truncated: String = self.context.chars().take(SCOPE_CONTEXT_MAX - 1).collect();
            self.context = format!("{truncated}…");
        }
        !self.resource_ids.is_empty() || !self.resource_types.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.resource_ids.is_empty() && self.resource_types.is_empty()
    }
}

/// Alert as delivered by the alert manager adapter
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub level: String,
    pub resource_id: String,
    pub resource_name: String,
    #[serde(default)]
    pub instance: String,
    pub value: f64,
    pub threshold: f64,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Alert {
    /// Key identifying the resource the alert refers to; empty when unknown
    pub fn resource_key(&self) -> String {
        if !self.resource_id.is_empty() {
            return self.resource_id.clone();
        }
        if !self.instance.is_empty() && !self.resource_name.is_empty() {
            return format!("{}/{}", self.instance, self.resource_name);
        }
        self.resource_name.clone()
    }

    /// Metadata value as a float, accepting numbers or numeric strings
    pub fn metadata_f64(&self, key: &str) -> Option<f64> {
        match self.metadata.get(key)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Metadata value as a string, accepting strings or numbers
    pub fn metadata_str(&self, key: &str) -> Option<String> {
        match self.metadata.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}
