//! One patrol run, end to end
//!
//! gate → snapshot → triage → scope resolve → seed → LLM → parse/validate →
//! emit → post-actions → record. Every run, including gated and failed
//! ones, leaves a record in the history store.

use super::{investigation_eligible, parse, seed, triage, PatrolEngine};
use crate::correlation::CorrelationEvent;
use crate::findings::AddOutcome;
use crate::patterns::FailureEvent;
use crate::models::{
    Finding, LifecycleEvent, LifecycleEventKind, PatrolRunRecord, PatrolScope, PatrolType,
    ResourcesChecked, RunStatus, Severity, TokenUsage,
};
use crate::providers::{ChatMessage, ChatRequest};
use crate::snapshot::StateSnapshot;
use crate::thresholds::PatrolThresholds;
use chrono::Utc;
use tracing::{debug, info, warn};

const PATROL_SYSTEM_PROMPT: &str = "\
You are an infrastructure patrol analyst for a Proxmox and Docker estate. \
You receive an inventory summary, flagged resources with their metrics, and \
historical context. Report only real, evidenced problems on the resources \
provided. For each problem emit exactly one block:

[FINDING]
SEVERITY: info|watch|warning|critical
CATEGORY: performance|reliability|security|capacity|backup|cost|maintenance
RESOURCE: <resource id as given>
RESOURCE_TYPE: <node|vm|container|docker-host|storage|pbs|pmg>
TITLE: <short title>
DESCRIPTION: <what is wrong>
RECOMMENDATION: <what to do about it>
EVIDENCE: <the metric values supporting the finding>
[/FINDING]

Emit nothing else around the blocks. If nothing is wrong, emit no blocks.";

/// Working state accumulated while a run executes
struct RunDraft {
    id: String,
    started_at: chrono::DateTime<chrono::Utc>,
    patrol_type: PatrolType,
    checked: ResourcesChecked,
    new_findings: usize,
    existing_findings: usize,
    resolved_findings: usize,
    rejected_findings: usize,
    auto_fixes: usize,
    finding_ids: Vec<String>,
    summary: String,
    status: RunStatus,
    usage: TokenUsage,
    model: String,
    error_count: usize,
}

impl RunDraft {
    fn new(patrol_type: PatrolType) -> Self {
        Self {
            id: run_id(),
            started_at: Utc::now(),
            patrol_type,
            checked: ResourcesChecked::default(),
            new_findings: 0,
            existing_findings: 0,
            resolved_findings: 0,
            rejected_findings: 0,
            auto_fixes: 0,
            finding_ids: Vec::new(),
            summary: String::new(),
            status: RunStatus::Ok,
            usage: TokenUsage::default(),
            model: String::new(),
            error_count: 0,
        }
    }

    fn skipped(mut self, reason: &str) -> Self {
        self.status = RunStatus::Skipped;
        self.summary = reason.to_string();
        self
    }

    fn errored(mut self, reason: &str) -> Self {
        self.status = RunStatus::Error;
        self.error_count += 1;
        self.summary = reason.to_string();
        self
    }
}

/// Timestamp-derived run id
fn run_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("run-{:x}{:x}", now.as_secs(), now.subsec_nanos())
}

/// Metric a finding key refers to, for resolution syncing and fix
/// verification
pub(crate) fn metric_for_key(key: &str) -> Option<&'static str> {
    if key.contains("disk") {
        Some("disk")
    } else if key.contains("storage") || key.contains("usage") || key.contains("datastore") {
        Some("usage")
    } else if key.contains("memory") || key.contains("ram") {
        Some("memory")
    } else if key.contains("cpu") {
        Some("cpu")
    } else {
        None
    }
}

/// Current value of a metric on a resource in the snapshot
pub(crate) fn current_metric(
    snapshot: &StateSnapshot,
    resource_id: &str,
    metric: &str,
) -> Option<f64> {
    if let Some(n) = snapshot.nodes.iter().find(|n| n.id == resource_id) {
        return match metric {
            "cpu" => Some(n.cpu_percent),
            "memory" => Some(n.memory_percent),
            "disk" => Some(n.disk_percent),
            _ => None,
        };
    }
    if let Some(g) = snapshot.guests.iter().find(|g| g.id == resource_id) {
        return match metric {
            "cpu" => Some(g.cpu_percent),
            "memory" => Some(g.memory_percent),
            "disk" => Some(g.disk_percent),
            _ => None,
        };
    }
    if let Some(d) = snapshot.docker_hosts.iter().find(|d| d.id == resource_id) {
        return match metric {
            "cpu" => Some(d.cpu_percent),
            "memory" => Some(d.memory_percent),
            "disk" => Some(d.disk_percent),
            _ => None,
        };
    }
    if let Some(s) = snapshot.storage.iter().find(|s| s.id == resource_id) {
        return match metric {
            "usage" | "disk" => Some(s.usage_percent),
            _ => None,
        };
    }
    if let Some(b) = snapshot.backup_servers.iter().find(|b| b.id == resource_id) {
        return match metric {
            "usage" => Some(b.datastore_usage_percent),
            "memory" => Some(b.memory_percent),
            "cpu" => Some(b.cpu_percent),
            _ => None,
        };
    }
    if let Some(m) = snapshot.mail_gateways.iter().find(|m| m.id == resource_id) {
        return match metric {
            "memory" => Some(m.memory_percent),
            "cpu" => Some(m.cpu_percent),
            _ => None,
        };
    }
    None
}

impl PatrolEngine {
    /// Execute one patrol run. The caller holds the run gate.
    pub(crate) async fn execute_run(
        &self,
        patrol_type: PatrolType,
        scope: Option<PatrolScope>,
    ) -> RunStatus {
        let mut draft = RunDraft::new(patrol_type);

        let trigger_label = scope
            .as_ref()
            .and_then(|s| s.reason.split(':').next().map(str::to_string))
            .unwrap_or_else(|| "tick".to_string());
        self.metrics.inc_run(&trigger_label, &patrol_type.to_string());

        let (enabled, llm_timeout, auto_fix, confidence_floor, markers, model) = {
            let cfg = self.config.read().unwrap();
            (
                cfg.enabled,
                cfg.llm_timeout,
                cfg.auto_fix,
                cfg.correlation_confidence_floor,
                cfg.reasoning_markers.clone(),
                cfg.model.clone(),
            )
        };

        // Gate: feature off or collaborators missing means skip, not error
        if !enabled {
            return self.finalize(draft.skipped("patrol disabled")).await;
        }
        let Some(llm) = self.llm.clone() else {
            return self.finalize(draft.skipped("no LLM provider configured")).await;
        };
        let Some(state_provider) = self.state_provider.clone() else {
            return self.finalize(draft.skipped("no state provider configured")).await;
        };

        self.refresh_thresholds();
        let thresholds = self.current_thresholds();

        let mut snapshot = match state_provider.get_state().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "State snapshot unavailable");
                return self.finalize(draft.errored("state snapshot unavailable")).await;
            }
        };
        snapshot.normalize();

        // Triage bounds the LLM's attention
        let report = triage::triage(&snapshot, &thresholds, &self.baselines);
        draft.checked = report.checked;
        self.metrics.observe_triage_flags(report.flags.len());
        self.status.write().unwrap().last_triage_flags = report.flags.len();

        if report.is_quiet() && patrol_type == PatrolType::Scheduled {
            debug!("Triage quiet, skipping LLM for scheduled patrol");
            self.metrics.inc_triage_quiet();
            draft.summary = "triage quiet, nothing to analyze".to_string();
            return self.finalize(draft).await;
        }

        // Scope: scheduled runs cover everything; triggered runs are
        // limited, expanded by correlated neighbors
        let resolved_scope = match scope {
            None => None,
            Some(mut s) => {
                if !s.normalize() {
                    return self.finalize(draft.skipped("empty patrol scope")).await;
                }
                let expanded = self
                    .correlation
                    .correlated_resources(&s.resource_ids, confidence_floor);
                if !expanded.is_empty() {
                    debug!(count = expanded.len(), "Scope expanded by correlations");
                    s.resource_ids.extend(expanded);
                }
                Some(s)
            }
        };

        // Seed assembly under the model's token budget
        let sections = self
            .build_seed_sections(&snapshot, &report, resolved_scope.as_ref(), &thresholds)
            .await;
        let budget = seed::compute_budget(llm.context_window());
        let seed_out = seed::assemble(&sections, budget);
        if !seed_out.dropped.is_empty() {
            debug!(dropped = ?seed_out.dropped, "Seed sections dropped for budget");
        }

        // Circuit breaker wraps the LLM call
        if !self.circuit.allow_call() {
            self.metrics.inc_circuit_block();
            return self.finalize(draft.skipped("LLM circuit breaker open")).await;
        }

        let request = ChatRequest {
            messages: vec![
                ChatMessage::system(PATROL_SYSTEM_PROMPT),
                ChatMessage::user(seed_out.text),
            ],
            model,
            max_tokens: None,
        };
        let response = match tokio::time::timeout(llm_timeout, llm.chat(request)).await {
            Ok(Ok(response)) => {
                self.circuit.record_success();
                response
            }
            Ok(Err(e)) => {
                warn!(error = %e, "LLM call failed");
                self.circuit.record_failure();
                return self.finalize(draft.errored("LLM call failed")).await;
            }
            Err(_) => {
                warn!(timeout_secs = llm_timeout.as_secs(), "LLM call timed out");
                self.circuit.record_failure();
                return self.finalize(draft.errored("LLM call timed out")).await;
            }
        };
        draft.usage = response.usage;
        draft.model = response.model.clone();

        // Parse, validate against thresholds, and emit
        let stripped = parse::strip_reasoning(&response.content, &markers);
        for parsed in parse::parse_findings(&stripped) {
            if let Some((metric, value)) = parse::claimed_metric(&parsed) {
                if let Some(watch) = thresholds.watch_for(&parsed.resource_type, metric) {
                    if value <= watch {
                        debug!(
                            resource = %parsed.resource,
                            metric,
                            value,
                            watch,
                            "Rejecting finding below threshold"
                        );
                        self.metrics
                            .inc_finding_rejected(&parsed.resource_type, metric);
                        draft.rejected_findings += 1;
                        continue;
                    }
                }
            }

            let finding = self.finding_from_parsed(&parsed, &snapshot);
            let id = finding.id.clone();
            match self.findings.add_detailed(finding).await {
                AddOutcome::Created => {
                    draft.new_findings += 1;
                    if let Some(f) = self.findings.get(&id).await {
                        self.logger.log_finding_detected(
                            &f.id,
                            &f.resource_id,
                            &f.severity.to_string(),
                            &f.key,
                            &f.title,
                        );
                        // New findings are events for the correlation and
                        // pattern detectors
                        self.correlation.record_event(CorrelationEvent {
                            resource_id: f.resource_id.clone(),
                            resource_name: f.resource_name.clone(),
                            resource_type: f.resource_type.clone(),
                            event_type: f.key.clone(),
                            timestamp: Utc::now(),
                        });
                        if f.severity >= Severity::Warning {
                            self.patterns.record_failure(FailureEvent {
                                resource_id: f.resource_id.clone(),
                                resource_name: f.resource_name.clone(),
                                kind: f.key.clone(),
                                timestamp: Utc::now(),
                            });
                        }
                    }
                }
                AddOutcome::Refreshed | AddOutcome::Regressed => draft.existing_findings += 1,
            }
            if let Some(sink) = self.unified_sink() {
                if let Some(f) = self.findings.get(&id).await {
                    sink(&f);
                }
            }
            draft.finding_ids.push(id);
        }

        // Post-actions
        draft.resolved_findings = self.sync_resolved(&snapshot, &thresholds).await;

        if auto_fix {
            if let Some(executor) = &self.runbook_executor {
                let active = self.findings.get_active(Severity::Info).await;
                let results = executor.auto_fix(&active, &self.catalog, &thresholds).await;
                draft.auto_fixes = results.len();
                for result in &results {
                    self.findings
                        .record_event(
                            &result.finding_id,
                            LifecycleEvent::with_detail(
                                LifecycleEventKind::AutoFixApplied,
                                format!("{}: {}", result.runbook_id, result.outcome),
                            ),
                        )
                        .await;
                    self.logger.log_runbook_execution(
                        &result.runbook_id,
                        &result.finding_id,
                        &result.outcome.to_string(),
                        result.steps.len(),
                    );
                }
            }
        }

        if let Some(orchestrator) = self.orchestrator() {
            for finding in self
                .findings
                .get_active(Severity::Info)
                .await
                .into_iter()
                .filter(investigation_eligible)
            {
                orchestrator.dispatch(finding).await;
            }
        }

        draft.status = if draft.new_findings > 0 {
            RunStatus::IssuesFound
        } else {
            RunStatus::Ok
        };
        draft.summary = format!(
            "{} new, {} existing, {} resolved, {} rejected",
            draft.new_findings,
            draft.existing_findings,
            draft.resolved_findings,
            draft.rejected_findings
        );
        self.finalize(draft).await
    }

    /// Resolve active metric findings whose metric is back under watch
    async fn sync_resolved(
        &self,
        snapshot: &StateSnapshot,
        thresholds: &PatrolThresholds,
    ) -> usize {
        let mut resolved = 0;
        for finding in self.findings.get_active(Severity::Info).await {
            let Some(metric) = metric_for_key(&finding.key) else {
                continue;
            };
            let Some(value) = current_metric(snapshot, &finding.resource_id, metric) else {
                continue;
            };
            let Some(watch) = thresholds.watch_for(&finding.resource_type, metric) else {
                continue;
            };
            if value <= watch && self.findings.resolve(&finding.id, false).await {
                resolved += 1;
                self.logger.log_finding_resolved(
                    &finding.id,
                    &finding.resource_id,
                    &format!("{metric} back at {value:.0}%, under watch {watch:.0}%"),
                );
            }
        }
        resolved
    }

    fn finding_from_parsed(
        &self,
        parsed: &parse::ParsedFinding,
        snapshot: &StateSnapshot,
    ) -> Finding {
        let resource_name = snapshot
            .resource_name(&parsed.resource)
            .map(str::to_string)
            .unwrap_or_else(|| {
                parsed
                    .resource
                    .rsplit('/')
                    .next()
                    .unwrap_or(&parsed.resource)
                    .to_string()
            });
        let node = snapshot
            .guests
            .iter()
            .find(|g| g.id == parsed.resource)
            .map(|g| g.node.clone())
            .unwrap_or_default();

        Finding::new(
            parsed.key(),
            parsed.severity,
            parsed.category,
            parsed.resource.clone(),
            resource_name,
            parsed.resource_type.clone(),
            node,
            parsed.title.clone(),
        )
        .with_description(parsed.description.clone())
        .with_recommendation(parsed.recommendation.clone())
        .with_evidence(parsed.evidence.clone())
    }

    /// Assemble the prioritized seed sections for this run
    async fn build_seed_sections(
        &self,
        snapshot: &StateSnapshot,
        report: &triage::TriageReport,
        scope: Option<&PatrolScope>,
        thresholds: &PatrolThresholds,
    ) -> Vec<seed::SeedSection> {
        let mut sections = Vec::new();

        // P0: inventory summary and previous-run digest
        let mut inventory = format!(
            "{} nodes, {} guests, {} docker hosts, {} storage pools, {} backup servers, \
             {} mail gateways",
            snapshot.nodes.len(),
            snapshot.guests.len(),
            snapshot.docker_hosts.len(),
            snapshot.storage.len(),
            snapshot.backup_servers.len(),
            snapshot.mail_gateways.len(),
        );
        if let Some(previous) = self.history.latest().await {
            inventory.push_str(&format!(
                "\nPrevious patrol {}: {:?}, {} new findings, {} resolved",
                previous.completed_at.format("%Y-%m-%d %H:%M UTC"),
                previous.status,
                previous.new_findings,
                previous.resolved_findings,
            ));
        }
        sections.push(seed::SeedSection::new(0, "infrastructure inventory", inventory));

        // P1: scoped resource details, flagged metrics, active findings
        let empty_scope = std::collections::BTreeSet::new();
        let scope_ids = scope.map(|s| &s.resource_ids).unwrap_or(&empty_scope);
        let mut details = String::new();
        for flag in report.flags_for(scope_ids) {
            let line = match &flag.reason {
                triage::FlagReason::Threshold { watch } => format!(
                    "{} {} ({}) on {}: {} at {:.1}% (watch {:.0}%)",
                    flag.resource_type,
                    flag.resource_name,
                    flag.resource_id,
                    flag.node,
                    flag.metric,
                    flag.value,
                    watch
                ),
                triage::FlagReason::Anomaly { expected, z_score } => format!(
                    "{} {} ({}) on {}: {} at {:.1}%, baseline {:.1}% (z={:.1})",
                    flag.resource_type,
                    flag.resource_name,
                    flag.resource_id,
                    flag.node,
                    flag.metric,
                    flag.value,
                    expected,
                    z_score
                ),
            };
            details.push_str(&line);
            details.push('\n');
        }
        for finding in self.findings.get_active(Severity::Info).await.iter().take(10) {
            details.push_str(&format!(
                "active finding [{}] {} on {} ({})\n",
                finding.severity, finding.title, finding.resource_name, finding.resource_id
            ));
        }
        if let Some(manager) = &self.alert_manager {
            for alert in manager.active_alerts().await.iter().take(10) {
                details.push_str(&format!(
                    "active alert [{}] {} on {}: {:.1} (threshold {:.1})\n",
                    alert.level, alert.alert_type, alert.resource_key(), alert.value,
                    alert.threshold
                ));
            }
        }
        if let Some(s) = scope {
            if !s.context.is_empty() {
                details.push_str(&format!("trigger context: {}\n", s.context));
            }
            details.push_str(&format!("patrol reason: {}\n", s.reason));
        }
        details.push_str(&format!(
            "thresholds: guest disk watch {:.0}%, guest memory watch {:.0}%, storage watch {:.0}%",
            thresholds.guest_disk.watch, thresholds.guest_memory.watch, thresholds.storage.watch
        ));
        sections.push(seed::SeedSection::new(1, "scoped resource details", details));

        // P2: metrics history and baselines, with a summary fallback
        let baselines = self.baselines.established_points();
        let mut metrics_text = String::new();
        for point in baselines.iter().take(40) {
            metrics_text.push_str(&format!(
                "{} {}: mean {:.1}%, stddev {:.1} ({} samples)\n",
                point.resource_key, point.metric, point.mean, point.std_dev, point.sample_count
            ));
        }
        if let Some(history) = &self.metrics_history {
            for flag in report.flags.iter().take(10) {
                let points = history
                    .recent_points(&flag.resource_id, &flag.metric, 12)
                    .await;
                if points.is_empty() {
                    continue;
                }
                let series: Vec<String> =
                    points.iter().map(|p| format!("{:.0}", p.value)).collect();
                metrics_text.push_str(&format!(
                    "{} {} recent: {}\n",
                    flag.resource_id,
                    flag.metric,
                    series.join(", ")
                ));
            }
        }
        if !metrics_text.is_empty() {
            let summary = format!(
                "{} established baselines; {} resources flagged this run",
                baselines.len(),
                report.flags.len()
            );
            sections.push(
                seed::SeedSection::new(2, "metrics history and baselines", metrics_text)
                    .with_summary(summary),
            );
        }

        // P3: correlations and recurring patterns
        let correlations = self.correlation.format_for_context(10);
        let patterns = self.patterns.format_for_context(10);
        if !correlations.is_empty() || !patterns.is_empty() {
            let mut text = correlations;
            if !patterns.is_empty() {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&patterns);
            }
            sections.push(seed::SeedSection::new(3, "correlations and patterns", text));
        }

        // P4: recent changes and remediation attempts
        let mut hints = String::new();
        for change in self.change_log.recent(10) {
            hints.push_str(&format!(
                "change on {}: {} ({})\n",
                change.resource_id, change.description, change.change_type
            ));
        }
        for attempt in self.remediation_log.recent(5) {
            hints.push_str(&format!(
                "remediation on {}: {} -> {}\n",
                attempt.resource_id, attempt.runbook_id, attempt.result
            ));
        }
        if let Some(manager) = &self.alert_manager {
            for alert in manager.recently_resolved(30).await.iter().take(5) {
                hints.push_str(&format!(
                    "recently cleared alert {} on {}\n",
                    alert.alert_type,
                    alert.resource_key()
                ));
            }
        }
        if !hints.is_empty() {
            sections.push(seed::SeedSection::new(4, "recent activity", hints));
        }

        sections
    }

    /// Record the run and update the engine status snapshot
    async fn finalize(&self, draft: RunDraft) -> RunStatus {
        let completed_at = Utc::now();
        let duration_ms = (completed_at - draft.started_at).num_milliseconds().max(0) as u64;

        let record = PatrolRunRecord {
            id: draft.id.clone(),
            started_at: draft.started_at,
            completed_at,
            duration_ms,
            patrol_type: draft.patrol_type,
            checked: draft.checked,
            new_findings: draft.new_findings,
            existing_findings: draft.existing_findings,
            resolved_findings: draft.resolved_findings,
            rejected_findings: draft.rejected_findings,
            auto_fixes: draft.auto_fixes,
            findings_summary: draft.summary.clone(),
            finding_ids: draft.finding_ids.clone(),
            status: draft.status,
            usage: draft.usage,
            model: draft.model.clone(),
            error_count: draft.error_count,
        };
        self.history.record(record).await;

        {
            let mut status = self.status.write().unwrap();
            status.last_run_id = Some(draft.id.clone());
            status.last_run_at = Some(completed_at);
            status.last_status = Some(draft.status);
            status.last_error_count = draft.error_count;
            status.runs_completed += 1;
            status.healthy = draft.status != RunStatus::Error && draft.error_count == 0;
        }

        self.logger.log_patrol_complete(
            &draft.id,
            &draft.patrol_type.to_string(),
            &format!("{:?}", draft.status),
            draft.new_findings,
            draft.resolved_findings,
            duration_ms,
        );
        info!(
            run_id = %draft.id,
            status = ?draft.status,
            new_findings = draft.new_findings,
            resolved = draft.resolved_findings,
            rejected = draft.rejected_findings,
            "Patrol run recorded"
        );
        draft.status
    }
}
