//! Observability infrastructure for the patrol subsystem
//!
//! Provides:
//! - Prometheus metrics (rejections, circuit blocks, run counts, triage sizes)
//! - Structured logging of patrol events with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Histogram, IntCounter,
    IntCounterVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Buckets for the triage-flag and replay-batch histograms
const COUNT_BUCKETS: &[f64] = &[0.0, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PatrolMetricsInner> = OnceLock::new();

struct PatrolMetricsInner {
    finding_rejected: IntCounterVec,
    circuit_block: IntCounter,
    investigation_outcome: IntCounterVec,
    fix_verification: IntCounterVec,
    run_total: IntCounterVec,
    scoped_dropped: IntCounter,
    scoped_dropped_final: IntCounter,
    triage_quiet: IntCounter,
    triage_flags: Histogram,
    stream_replay_batch_size: Histogram,
    stream_resume: IntCounter,
    stream_resync: IntCounter,
}

impl PatrolMetricsInner {
    fn new() -> Self {
        Self {
            finding_rejected: register_int_counter_vec!(
                "patrol_finding_rejected_total",
                "Findings rejected because the claimed value did not exceed the threshold",
                &["resource_type", "metric"]
            )
            .expect("Failed to register finding_rejected_total"),

            circuit_block: register_int_counter!(
                "patrol_circuit_block_total",
                "Patrol runs skipped because the LLM circuit breaker was open"
            )
            .expect("Failed to register circuit_block_total"),

            investigation_outcome: register_int_counter_vec!(
                "patrol_investigation_outcome_total",
                "Completed investigations by outcome",
                &["outcome"]
            )
            .expect("Failed to register investigation_outcome_total"),

            fix_verification: register_int_counter_vec!(
                "patrol_fix_verification_total",
                "Runbook verification results",
                &["result"]
            )
            .expect("Failed to register fix_verification_total"),

            run_total: register_int_counter_vec!(
                "patrol_run_total",
                "Patrol runs by trigger and type",
                &["trigger", "type"]
            )
            .expect("Failed to register run_total"),

            scoped_dropped: register_int_counter!(
                "patrol_scoped_dropped_total",
                "Scoped patrol requests deferred because a run was active"
            )
            .expect("Failed to register scoped_dropped_total"),

            scoped_dropped_final: register_int_counter!(
                "patrol_scoped_dropped_final_total",
                "Scoped patrol requests dropped after exhausting retries"
            )
            .expect("Failed to register scoped_dropped_final_total"),

            triage_quiet: register_int_counter!(
                "patrol_triage_quiet_total",
                "Scheduled runs skipped because triage flagged nothing"
            )
            .expect("Failed to register triage_quiet_total"),

            triage_flags: register_histogram!(
                "patrol_triage_flags",
                "Resources flagged by triage per run",
                COUNT_BUCKETS.to_vec()
            )
            .expect("Failed to register triage_flags"),

            stream_replay_batch_size: register_histogram!(
                "patrol_stream_replay_batch_size",
                "Pending triggers replayed per drain",
                COUNT_BUCKETS.to_vec()
            )
            .expect("Failed to register stream_replay_batch_size"),

            stream_resume: register_int_counter!(
                "patrol_stream_resume_total",
                "Trigger stream drains resumed after the engine freed up"
            )
            .expect("Failed to register stream_resume_total"),

            stream_resync: register_int_counter!(
                "patrol_stream_resync_total",
                "Trigger queue overflows forcing a drop-and-rescan"
            )
            .expect("Failed to register stream_resync_total"),
        }
    }
}

/// Patrol metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying series.
#[derive(Clone)]
pub struct PatrolMetrics {
    _private: (),
}

impl Default for PatrolMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PatrolMetrics {
    /// Create a metrics handle, initializing the global series if needed
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PatrolMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PatrolMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn inc_finding_rejected(&self, resource_type: &str, metric: &str) {
        self.inner()
            .finding_rejected
            .with_label_values(&[resource_type, metric])
            .inc();
    }

    pub fn inc_circuit_block(&self) {
        self.inner().circuit_block.inc();
    }

    pub fn inc_investigation_outcome(&self, outcome: &str) {
        self.inner()
            .investigation_outcome
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn inc_fix_verification(&self, result: &str) {
        self.inner()
            .fix_verification
            .with_label_values(&[result])
            .inc();
    }

    pub fn inc_run(&self, trigger: &str, patrol_type: &str) {
        self.inner()
            .run_total
            .with_label_values(&[trigger, patrol_type])
            .inc();
    }

    pub fn inc_scoped_dropped(&self) {
        self.inner().scoped_dropped.inc();
    }

    pub fn inc_scoped_dropped_final(&self) {
        self.inner().scoped_dropped_final.inc();
    }

    pub fn inc_triage_quiet(&self) {
        self.inner().triage_quiet.inc();
    }

    pub fn observe_triage_flags(&self, count: usize) {
        self.inner().triage_flags.observe(count as f64);
    }

    pub fn observe_replay_batch(&self, size: usize) {
        self.inner().stream_replay_batch_size.observe(size as f64);
    }

    pub fn inc_stream_resume(&self) {
        self.inner().stream_resume.inc();
    }

    pub fn inc_stream_resync(&self) {
        self.inner().stream_resync.inc();
    }
}

/// Structured logger for patrol events
///
/// Provides consistent `event = "..."` log lines for finding lifecycle,
/// runbook execution, and run completion.
#[derive(Clone)]
pub struct PatrolLogger {
    instance: String,
}

impl PatrolLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_finding_detected(
        &self,
        finding_id: &str,
        resource_id: &str,
        severity: &str,
        key: &str,
        title: &str,
    ) {
        info!(
            event = "finding_detected",
            instance = %self.instance,
            finding_id = %finding_id,
            resource_id = %resource_id,
            severity = %severity,
            key = %key,
            title = %title,
            "Patrol finding detected"
        );
    }

    pub fn log_finding_resolved(&self, finding_id: &str, resource_id: &str, note: &str) {
        info!(
            event = "finding_resolved",
            instance = %self.instance,
            finding_id = %finding_id,
            resource_id = %resource_id,
            note = %note,
            "Patrol finding resolved"
        );
    }

    pub fn log_runbook_execution(
        &self,
        runbook_id: &str,
        finding_id: &str,
        outcome: &str,
        steps_run: usize,
    ) {
        if outcome == "failed" {
            warn!(
                event = "runbook_executed",
                instance = %self.instance,
                runbook_id = %runbook_id,
                finding_id = %finding_id,
                outcome = %outcome,
                steps_run = steps_run,
                "Runbook execution failed"
            );
        } else {
            info!(
                event = "runbook_executed",
                instance = %self.instance,
                runbook_id = %runbook_id,
                finding_id = %finding_id,
                outcome = %outcome,
                steps_run = steps_run,
                "Runbook executed"
            );
        }
    }

    pub fn log_patrol_complete(
        &self,
        run_id: &str,
        patrol_type: &str,
        status: &str,
        new_findings: usize,
        resolved: usize,
        duration_ms: u64,
    ) {
        info!(
            event = "patrol_complete",
            instance = %self.instance,
            run_id = %run_id,
            patrol_type = %patrol_type,
            status = %status,
            new_findings = new_findings,
            resolved = resolved,
            duration_ms = duration_ms,
            "Patrol run complete"
        );
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "patrol_started",
            instance = %self.instance,
            version = %version,
            "Patrol subsystem started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "patrol_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Patrol subsystem shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_handle() {
        // Metrics register against the global registry once; exercise the
        // full handle surface.
        let metrics = PatrolMetrics::new();

        metrics.inc_finding_rejected("vm", "disk");
        metrics.inc_circuit_block();
        metrics.inc_investigation_outcome("fix_verified");
        metrics.inc_fix_verification("resolved");
        metrics.inc_run("tick", "scheduled");
        metrics.inc_scoped_dropped();
        metrics.inc_scoped_dropped_final();
        metrics.inc_triage_quiet();
        metrics.observe_triage_flags(3);
        metrics.observe_replay_batch(2);
        metrics.inc_stream_resume();
        metrics.inc_stream_resync();
    }

    #[test]
    fn test_logger_creation() {
        let logger = PatrolLogger::new("pve-cluster");
        assert_eq!(logger.instance, "pve-cluster");
    }
}
