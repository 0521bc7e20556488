//! Runbook catalog and executor
//!
//! Runbooks are fixed, immutable procedures applicable to findings matching
//! a key/type filter. Execution renders each step's command template against
//! a context derived from the finding, submits it to a connected agent, and
//! runs a structured verification afterwards. Only a verified fix resolves
//! the finding.

use crate::logs::{RemediationEntry, RemediationLog, RemediationResult};
use crate::models::Finding;
use crate::observability::PatrolMetrics;
use crate::providers::{AgentExecutor, CommandRequest, FindingResolver, TargetType};
use crate::thresholds::PatrolThresholds;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Cooldown before another auto-fix attempt against the same finding
pub const AUTO_FIX_COOLDOWN: Duration = Duration::from_secs(6 * 60 * 60);

/// Risk class of a runbook; only low-risk entries are auto-applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunbookRisk {
    Low,
    Medium,
    High,
}

/// One templated command in a runbook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunbookStep {
    /// Command template; `{{placeholder}}` is substituted from the context
    pub command: String,
    /// Run on the agent host rather than inside the guest
    #[serde(default)]
    pub run_on_host: bool,
    /// A failing step does not halt the runbook
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default = "default_step_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_step_timeout_secs() -> u64 {
    30
}

/// Post-execution verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub command: String,
    #[serde(default)]
    pub run_on_host: bool,
    /// Named verifier, e.g. `disk-usage`; takes precedence over the regexes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_regex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_regex: Option<String>,
}

/// Immutable catalog entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runbook {
    pub id: String,
    pub title: String,
    pub description: String,
    pub risk: RunbookRisk,
    /// Finding keys this runbook applies to; empty matches all
    pub finding_keys: Vec<String>,
    /// Resource types this runbook applies to; empty matches all
    pub resource_types: Vec<String>,
    pub steps: Vec<RunbookStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
    pub resolution_note: String,
}

impl Runbook {
    /// A runbook applies iff both filters accept the finding
    pub fn applies_to(&self, finding: &Finding) -> bool {
        let key_ok =
            self.finding_keys.is_empty() || self.finding_keys.iter().any(|k| k == &finding.key);
        let type_ok = self.resource_types.is_empty()
            || self.resource_types.iter().any(|t| t == &finding.resource_type);
        key_ok && type_ok
    }
}

/// The fixed runbook catalog
pub fn builtin_catalog() -> Vec<Runbook> {
    vec![
        Runbook {
            id: "clear-disk-space".to_string(),
            title: "Clear disk space".to_string(),
            description: "Vacuum journals and package caches on a guest with a full root disk"
                .to_string(),
            risk: RunbookRisk::Low,
            finding_keys: vec!["high-disk".to_string(), "disk-full".to_string()],
            resource_types: vec!["vm".to_string(), "container".to_string()],
            steps: vec![
                RunbookStep {
                    command: "journalctl --vacuum-time=2d".to_string(),
                    run_on_host: false,
                    allow_failure: false,
                    timeout_secs: 60,
                },
                RunbookStep {
                    command: "apt-get clean".to_string(),
                    run_on_host: false,
                    allow_failure: true,
                    timeout_secs: 60,
                },
            ],
            verification: Some(Verification {
                command: "df -P /".to_string(),
                run_on_host: false,
                verifier: Some("disk-usage".to_string()),
                success_regex: None,
                failure_regex: None,
            }),
            resolution_note: "Disk usage brought back under the watch threshold".to_string(),
        },
        Runbook {
            id: "restart-guest-agent".to_string(),
            title: "Restart guest agent".to_string(),
            description: "Restart the QEMU guest agent from the host when it stops responding"
                .to_string(),
            risk: RunbookRisk::Low,
            finding_keys: vec!["agent-unresponsive".to_string()],
            resource_types: vec!["vm".to_string()],
            steps: vec![RunbookStep {
                command: "qm guest cmd {{vmid}} ping".to_string(),
                run_on_host: true,
                allow_failure: true,
                timeout_secs: 15,
            }],
            verification: Some(Verification {
                command: "qm agent {{vmid}} ping".to_string(),
                run_on_host: true,
                verifier: None,
                success_regex: Some(r"(?i)^\s*$|pong".to_string()),
                failure_regex: Some(r"(?i)not running|timeout".to_string()),
            }),
            resolution_note: "Guest agent responding again".to_string(),
        },
        Runbook {
            id: "prune-backup-datastore".to_string(),
            title: "Prune backup datastore".to_string(),
            description: "Run the configured prune job on a filling backup datastore".to_string(),
            risk: RunbookRisk::Medium,
            finding_keys: vec!["datastore-full".to_string()],
            resource_types: vec!["pbs".to_string()],
            steps: vec![RunbookStep {
                command: "proxmox-backup-manager prune-job run {{job}}".to_string(),
                run_on_host: true,
                allow_failure: false,
                timeout_secs: 300,
            }],
            verification: Some(Verification {
                command: "df -P /".to_string(),
                run_on_host: true,
                verifier: Some("disk-usage".to_string()),
                success_regex: None,
                failure_regex: None,
            }),
            resolution_note: "Datastore usage reduced by prune".to_string(),
        },
    ]
}

/// Typed failures surfaced by the executor
#[derive(Debug, Error)]
pub enum RunbookError {
    #[error("placeholder {{{{{name}}}}} is empty or missing")]
    MissingPlaceholder { name: String },
    #[error("invalid verification regex: {0}")]
    InvalidRegex(String),
    #[error("agent executor unavailable")]
    ExecutorUnavailable,
    #[error(transparent)]
    Executor(#[from] anyhow::Error),
}

/// Result of one executed step
#[derive(Debug, Clone)]
pub struct StepResult {
    pub command: String,
    pub success: bool,
    pub exit_code: i32,
    pub output: String,
}

/// Result of one runbook execution
#[derive(Debug, Clone)]
pub struct RunbookResult {
    pub runbook_id: String,
    pub finding_id: String,
    pub outcome: RemediationResult,
    /// Whether the finding was resolved as part of this execution
    pub resolved: bool,
    pub steps: Vec<StepResult>,
    pub note: String,
}

/// Context values substituted into command templates
pub fn runbook_context(finding: &Finding) -> HashMap<String, String> {
    let mut ctx = HashMap::new();
    ctx.insert("resource_id".to_string(), finding.resource_id.clone());
    ctx.insert("resource_name".to_string(), finding.resource_name.clone());
    ctx.insert("node".to_string(), finding.node.clone());

    // VMID is the numeric tail of a guest resource id, e.g. "qemu/101"
    if let Some(tail) = finding.resource_id.rsplit('/').next() {
        if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
            ctx.insert("vmid".to_string(), tail.to_string());
        }
    }

    // PBS resources use a colon form: "pbs-name:datastore:job"
    if finding.resource_type == "pbs" {
        let parts: Vec<&str> = finding.resource_id.splitn(3, ':').collect();
        if let Some(pbs) = parts.first() {
            ctx.insert("pbs".to_string(), pbs.to_string());
        }
        if let Some(datastore) = parts.get(1) {
            ctx.insert("datastore".to_string(), datastore.to_string());
        }
        if let Some(job) = parts.get(2) {
            ctx.insert("job".to_string(), job.to_string());
        }
    }

    ctx
}

/// Quote a value for safe interpolation into a shell command
fn shell_escape(value: &str) -> String {
    let safe = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':'));
    if safe && !value.is_empty() {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Substitute `{{placeholder}}` occurrences; empty or missing referenced
/// placeholders fail the call
pub fn render_command(
    template: &str,
    ctx: &HashMap<String, String>,
) -> Result<String, RunbookError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let name = after[..end].trim();
        match ctx.get(name) {
            Some(value) if !value.is_empty() => out.push_str(&shell_escape(value)),
            _ => {
                return Err(RunbookError::MissingPlaceholder {
                    name: name.to_string(),
                })
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Extract the usage percentage of `/` from `df -P /` output
pub fn parse_root_usage_percent(output: &str) -> Option<f64> {
    for line in output.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.last() == Some(&"/") {
            return fields
                .iter()
                .find(|f| f.ends_with('%'))
                .and_then(|f| f.trim_end_matches('%').parse().ok());
        }
    }
    None
}

/// First percentage mentioned in a text, e.g. the baseline in evidence
fn parse_percent(text: &str) -> Option<f64> {
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() || (c == '.' && !digits.is_empty()) {
            digits.push(c);
        } else if c == '%' && !digits.is_empty() {
            return digits.parse().ok();
        } else {
            digits.clear();
        }
    }
    None
}

/// Executes runbooks against findings via the agent executor
pub struct RunbookExecutor {
    executor: Arc<dyn AgentExecutor>,
    resolver: Arc<dyn FindingResolver>,
    remediation_log: Arc<RemediationLog>,
    metrics: PatrolMetrics,
}

impl RunbookExecutor {
    pub fn new(
        executor: Arc<dyn AgentExecutor>,
        resolver: Arc<dyn FindingResolver>,
        remediation_log: Arc<RemediationLog>,
    ) -> Self {
        Self {
            executor,
            resolver,
            remediation_log,
            metrics: PatrolMetrics::new(),
        }
    }

    /// Execute one runbook against one finding
    pub async fn execute(
        &self,
        runbook: &Runbook,
        finding: &Finding,
        thresholds: &PatrolThresholds,
    ) -> Result<RunbookResult, RunbookError> {
        let ctx = runbook_context(finding);
        let mut steps_run: Vec<StepResult> = Vec::new();

        for (index, step) in runbook.steps.iter().enumerate() {
            let command = render_command(&step.command, &ctx)?;
            let outcome = self
                .submit(finding, &command, step.run_on_host, step.timeout_secs, &ctx)
                .await?;

            let step_result = StepResult {
                command: command.clone(),
                success: outcome.success,
                exit_code: outcome.exit_code,
                output: if outcome.stdout.is_empty() {
                    outcome.stderr.clone()
                } else {
                    outcome.stdout.clone()
                },
            };
            let failed = !step_result.success;
            steps_run.push(step_result);

            if failed && !step.allow_failure {
                warn!(
                    runbook_id = %runbook.id,
                    finding_id = %finding.id,
                    step = index,
                    exit_code = outcome.exit_code,
                    "Runbook step failed, halting"
                );
                let result = RunbookResult {
                    runbook_id: runbook.id.clone(),
                    finding_id: finding.id.clone(),
                    outcome: RemediationResult::Failed,
                    resolved: false,
                    steps: steps_run,
                    note: format!("step {} failed with exit code {}", index, outcome.exit_code),
                };
                self.log_attempt(finding, runbook, &result);
                return Ok(result);
            }
        }

        // All required steps succeeded; verify the effect
        let (verdict, note) = match &runbook.verification {
            Some(verification) => {
                self.verify(verification, finding, thresholds, &ctx).await?
            }
            None => (
                RemediationResult::Unknown,
                "no verification configured".to_string(),
            ),
        };
        self.metrics.inc_fix_verification(&verdict.to_string());

        let resolved = verdict == RemediationResult::Resolved
            && self
                .resolver
                .resolve_finding(&finding.id, &runbook.resolution_note)
                .await;

        let result = RunbookResult {
            runbook_id: runbook.id.clone(),
            finding_id: finding.id.clone(),
            outcome: verdict,
            resolved,
            steps: steps_run,
            note,
        };
        self.log_attempt(finding, runbook, &result);

        info!(
            runbook_id = %runbook.id,
            finding_id = %finding.id,
            outcome = %result.outcome,
            resolved = result.resolved,
            "Runbook execution complete"
        );
        Ok(result)
    }

    /// Apply the first applicable low-risk runbook to each finding, skipping
    /// findings with a recent remediation attempt. Returns the executed
    /// results in order.
    pub async fn auto_fix(
        &self,
        findings: &[Finding],
        catalog: &[Runbook],
        thresholds: &PatrolThresholds,
    ) -> Vec<RunbookResult> {
        let mut results = Vec::new();
        for finding in findings {
            if !finding.is_active() {
                continue;
            }
            let Some(runbook) = catalog
                .iter()
                .find(|r| r.risk == RunbookRisk::Low && r.applies_to(finding))
            else {
                continue;
            };
            if self
                .remediation_log
                .attempted_within(&finding.id, AUTO_FIX_COOLDOWN)
            {
                debug!(
                    finding_id = %finding.id,
                    runbook_id = %runbook.id,
                    "Skipping auto-fix, attempt within cooldown"
                );
                continue;
            }
            match self.execute(runbook, finding, thresholds).await {
                Ok(result) => results.push(result),
                Err(e) => warn!(
                    finding_id = %finding.id,
                    runbook_id = %runbook.id,
                    error = %e,
                    "Auto-fix execution error"
                ),
            }
        }
        results
    }

    async fn submit(
        &self,
        finding: &Finding,
        command: &str,
        run_on_host: bool,
        timeout_secs: u64,
        ctx: &HashMap<String, String>,
    ) -> Result<crate::providers::CommandOutcome, RunbookError> {
        let req = if run_on_host {
            let mut req = CommandRequest::host(command);
            req.timeout = Duration::from_secs(timeout_secs);
            req
        } else {
            let target = if finding.resource_type == "container" {
                TargetType::Container
            } else {
                TargetType::Vm
            };
            let vmid = ctx
                .get("vmid")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| RunbookError::MissingPlaceholder {
                    name: "vmid".to_string(),
                })?;
            let mut req = CommandRequest::guest(command, target, vmid);
            req.timeout = Duration::from_secs(timeout_secs);
            req
        };

        Ok(self.executor.execute_command(&finding.node, req).await?)
    }

    async fn verify(
        &self,
        verification: &Verification,
        finding: &Finding,
        thresholds: &PatrolThresholds,
        ctx: &HashMap<String, String>,
    ) -> Result<(RemediationResult, String), RunbookError> {
        let command = render_command(&verification.command, ctx)?;
        let outcome = self
            .submit(finding, &command, verification.run_on_host, 30, ctx)
            .await?;
        let output = if outcome.stdout.is_empty() {
            outcome.stderr.clone()
        } else {
            outcome.stdout.clone()
        };

        if verification.verifier.as_deref() == Some("disk-usage") {
            return Ok(Self::verify_disk_usage(&output, finding, thresholds));
        }

        if let Some(pattern) = &verification.success_regex {
            let re = Regex::new(pattern).map_err(|e| RunbookError::InvalidRegex(e.to_string()))?;
            if re.is_match(&output) {
                return Ok((RemediationResult::Resolved, "success pattern matched".to_string()));
            }
        }
        if let Some(pattern) = &verification.failure_regex {
            let re = Regex::new(pattern).map_err(|e| RunbookError::InvalidRegex(e.to_string()))?;
            if re.is_match(&output) {
                return Ok((RemediationResult::Failed, "failure pattern matched".to_string()));
            }
        }
        Ok((RemediationResult::Unknown, "no pattern matched".to_string()))
    }

    /// Outcome for the `disk-usage` verifier: resolved below the watch
    /// threshold, partial below the baseline from the evidence, failed at
    /// or above the baseline, unknown without a baseline.
    fn verify_disk_usage(
        output: &str,
        finding: &Finding,
        thresholds: &PatrolThresholds,
    ) -> (RemediationResult, String) {
        let Some(usage) = parse_root_usage_percent(output) else {
            return (
                RemediationResult::Unknown,
                "could not parse disk usage".to_string(),
            );
        };

        let watch = if finding.resource_type == "storage" || finding.resource_type == "pbs" {
            thresholds.storage.watch
        } else {
            thresholds.guest_disk.watch
        };

        if usage < watch {
            return (
                RemediationResult::Resolved,
                format!("usage {usage:.0}% below watch threshold {watch:.0}%"),
            );
        }

        match parse_percent(&finding.evidence) {
            Some(baseline) if usage < baseline => (
                RemediationResult::Partial,
                format!("usage {usage:.0}% improved from baseline {baseline:.0}%"),
            ),
            Some(baseline) => (
                RemediationResult::Failed,
                format!("usage {usage:.0}% not below baseline {baseline:.0}%"),
            ),
            None => (
                RemediationResult::Unknown,
                format!("usage {usage:.0}% above threshold, no baseline in evidence"),
            ),
        }
    }

    fn log_attempt(&self, finding: &Finding, runbook: &Runbook, result: &RunbookResult) {
        self.remediation_log.record(RemediationEntry {
            finding_id: finding.id.clone(),
            resource_id: finding.resource_id.clone(),
            runbook_id: runbook.id.clone(),
            result: result.outcome,
            detail: result.note.clone(),
            timestamp: Utc::now(),
        });
    }
}
