//! Investigation orchestration
//!
//! Launches bounded, concurrent investigations of findings through an
//! injected investigator adapter. Applied fixes are verified through a
//! narrow `FixVerifier` capability (implemented by the engine) before a
//! finding's outcome advances, and approval gates keep medium/high-risk
//! actions out of the automatic path.

use crate::findings::FindingsStore;
use crate::logs::RemediationResult;
use crate::models::{Finding, InvestigationOutcome, LifecycleEvent, LifecycleEventKind};
use crate::observability::PatrolMetrics;
use crate::providers::async_trait;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default bound on concurrently running investigations
const DEFAULT_MAX_CONCURRENT: usize = 2;

/// Result of one investigation
#[derive(Debug, Clone)]
pub struct InvestigationReport {
    pub outcome: InvestigationOutcome,
    pub summary: String,
    /// Whether the proposed remediation needs operator approval
    pub requires_approval: bool,
}

/// Adapter boundary: performs the actual investigation of a finding
#[async_trait]
pub trait Investigator: Send + Sync {
    async fn investigate(&self, finding: &Finding) -> Result<InvestigationReport>;
}

/// Narrow capability used to verify an applied fix; the engine implements
/// this against live telemetry
#[async_trait]
pub trait FixVerifier: Send + Sync {
    async fn verify_fix(&self, finding: &Finding) -> RemediationResult;
}

/// Launches and supervises investigations
pub struct InvestigationOrchestrator {
    investigator: Arc<dyn Investigator>,
    verifier: Arc<dyn FixVerifier>,
    findings: Arc<FindingsStore>,
    permits: Arc<Semaphore>,
    /// Approval gate: when false, fixes flagged as requiring approval are
    /// routed to manual handling instead of being applied
    auto_approve: bool,
    max_concurrent: usize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    metrics: PatrolMetrics,
}

impl InvestigationOrchestrator {
    pub fn new(
        investigator: Arc<dyn Investigator>,
        verifier: Arc<dyn FixVerifier>,
        findings: Arc<FindingsStore>,
    ) -> Self {
        Self::with_limits(investigator, verifier, findings, DEFAULT_MAX_CONCURRENT, false)
    }

    pub fn with_limits(
        investigator: Arc<dyn Investigator>,
        verifier: Arc<dyn FixVerifier>,
        findings: Arc<FindingsStore>,
        max_concurrent: usize,
        auto_approve: bool,
    ) -> Self {
        Self {
            investigator,
            verifier,
            findings,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            auto_approve,
            max_concurrent,
            tasks: Mutex::new(Vec::new()),
            metrics: PatrolMetrics::new(),
        }
    }

    /// Launch an investigation for a finding. Returns `false` when the
    /// concurrency bound is reached or the finding is already past the
    /// detected stage.
    pub async fn dispatch(self: &Arc<Self>, finding: Finding) -> bool {
        if finding.investigation_outcome != InvestigationOutcome::None {
            return false;
        }
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            debug!(finding_id = %finding.id, "Investigation bound reached, skipping");
            return false;
        };

        self.findings
            .record_event(
                &finding.id,
                LifecycleEvent::now(LifecycleEventKind::InvestigationStarted),
            )
            .await;
        self.findings
            .set_investigation_outcome(&finding.id, InvestigationOutcome::Investigating)
            .await;

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _permit = permit;
            this.run_investigation(finding).await;
        });
        self.tasks.lock().await.push(handle);
        true
    }

    async fn run_investigation(&self, finding: Finding) {
        let report = match self.investigator.investigate(&finding).await {
            Ok(report) => report,
            Err(e) => {
                warn!(finding_id = %finding.id, error = %e, "Investigation failed");
                self.metrics.inc_investigation_outcome("error");
                self.findings
                    .set_investigation_outcome(&finding.id, InvestigationOutcome::ManualRequired)
                    .await;
                return;
            }
        };

        let outcome = if report.requires_approval && !self.auto_approve {
            info!(
                finding_id = %finding.id,
                "Fix requires approval, routing to manual handling"
            );
            InvestigationOutcome::ManualRequired
        } else if report.outcome == InvestigationOutcome::FixApplied {
            // Verify the fix against live telemetry before trusting it
            match self.verifier.verify_fix(&finding).await {
                RemediationResult::Resolved => InvestigationOutcome::FixVerified,
                RemediationResult::Partial | RemediationResult::Unknown => {
                    InvestigationOutcome::FixApplied
                }
                RemediationResult::Failed => InvestigationOutcome::ManualRequired,
            }
        } else {
            report.outcome
        };

        self.metrics
            .inc_investigation_outcome(&outcome_label(outcome));
        self.findings
            .set_investigation_outcome(&finding.id, outcome)
            .await;
        self.findings
            .record_event(
                &finding.id,
                LifecycleEvent::with_detail(
                    LifecycleEventKind::InvestigationCompleted,
                    report.summary.clone(),
                ),
            )
            .await;

        if outcome == InvestigationOutcome::FixVerified {
            self.findings.resolve(&finding.id, false).await;
        }

        info!(
            finding_id = %finding.id,
            outcome = %outcome_label(outcome),
            "Investigation complete"
        );
    }

    /// Number of investigations currently running
    pub fn running(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.permits.available_permits())
    }

    /// Wait for running investigations to finish, up to the deadline
    pub async fn shutdown(&self, deadline: Duration) {
        let mut tasks = self.tasks.lock().await;
        let drain = async {
            for handle in tasks.drain(..) {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(deadline, drain).await.is_err() {
            warn!("Shutdown deadline reached with investigations still running");
        }
    }
}

fn outcome_label(outcome: InvestigationOutcome) -> String {
    match outcome {
        InvestigationOutcome::None => "none",
        InvestigationOutcome::Investigating => "investigating",
        InvestigationOutcome::Remediating => "remediating",
        InvestigationOutcome::FixApplied => "fix_applied",
        InvestigationOutcome::FixVerified => "fix_verified",
        InvestigationOutcome::ManualRequired => "manual_required",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FindingCategory, LoopState, Severity};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_finding(resource: &str) -> Finding {
        Finding::new(
            "high-disk",
            Severity::Warning,
            FindingCategory::Capacity,
            resource,
            "web01",
            "vm",
            "pve1",
            "Disk filling",
        )
    }

    struct StubInvestigator {
        outcome: InvestigationOutcome,
        requires_approval: bool,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl StubInvestigator {
        fn new(outcome: InvestigationOutcome, requires_approval: bool) -> Self {
            Self {
                outcome,
                requires_approval,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl Investigator for StubInvestigator {
        async fn investigate(&self, _finding: &Finding) -> Result<InvestigationReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(InvestigationReport {
                outcome: self.outcome,
                summary: "stub investigation".to_string(),
                requires_approval: self.requires_approval,
            })
        }
    }

    struct StubVerifier {
        result: RemediationResult,
    }

    #[async_trait]
    impl FixVerifier for StubVerifier {
        async fn verify_fix(&self, _finding: &Finding) -> RemediationResult {
            self.result
        }
    }

    async fn orchestrate(
        investigator: StubInvestigator,
        verifier_result: RemediationResult,
        max_concurrent: usize,
        auto_approve: bool,
    ) -> (Arc<InvestigationOrchestrator>, Arc<FindingsStore>) {
        let findings = Arc::new(FindingsStore::new());
        let orchestrator = Arc::new(InvestigationOrchestrator::with_limits(
            Arc::new(investigator),
            Arc::new(StubVerifier {
                result: verifier_result,
            }),
            findings.clone(),
            max_concurrent,
            auto_approve,
        ));
        (orchestrator, findings)
    }

    #[tokio::test]
    async fn test_verified_fix_resolves_finding() {
        let (orchestrator, findings) = orchestrate(
            StubInvestigator::new(InvestigationOutcome::FixApplied, false),
            RemediationResult::Resolved,
            2,
            false,
        )
        .await;

        let finding = test_finding("vm/101");
        findings.add(finding.clone()).await;
        let stored = findings.get(&finding.id).await.unwrap();

        assert!(orchestrator.dispatch(stored).await);
        orchestrator.shutdown(Duration::from_secs(1)).await;

        let after = findings.get(&finding.id).await.unwrap();
        assert_eq!(after.investigation_outcome, InvestigationOutcome::FixVerified);
        assert_eq!(after.loop_state, LoopState::Resolved);
        assert!(after.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_verification_routes_to_manual() {
        let (orchestrator, findings) = orchestrate(
            StubInvestigator::new(InvestigationOutcome::FixApplied, false),
            RemediationResult::Failed,
            2,
            false,
        )
        .await;

        let finding = test_finding("vm/101");
        findings.add(finding.clone()).await;
        let stored = findings.get(&finding.id).await.unwrap();

        orchestrator.dispatch(stored).await;
        orchestrator.shutdown(Duration::from_secs(1)).await;

        let after = findings.get(&finding.id).await.unwrap();
        assert_eq!(
            after.investigation_outcome,
            InvestigationOutcome::ManualRequired
        );
        assert_eq!(after.loop_state, LoopState::Manual);
        assert!(after.resolved_at.is_none());
    }

    #[tokio::test]
    async fn test_approval_gate_blocks_unapproved_fix() {
        let (orchestrator, findings) = orchestrate(
            StubInvestigator::new(InvestigationOutcome::FixApplied, true),
            RemediationResult::Resolved,
            2,
            false,
        )
        .await;

        let finding = test_finding("vm/101");
        findings.add(finding.clone()).await;
        let stored = findings.get(&finding.id).await.unwrap();

        orchestrator.dispatch(stored).await;
        orchestrator.shutdown(Duration::from_secs(1)).await;

        let after = findings.get(&finding.id).await.unwrap();
        assert_eq!(
            after.investigation_outcome,
            InvestigationOutcome::ManualRequired
        );
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let (orchestrator, findings) = orchestrate(
            StubInvestigator::new(InvestigationOutcome::Investigating, false)
                .with_delay(Duration::from_millis(200)),
            RemediationResult::Unknown,
            1,
            false,
        )
        .await;

        let a = test_finding("vm/101");
        let b = test_finding("vm/102");
        findings.add(a.clone()).await;
        findings.add(b.clone()).await;

        assert!(orchestrator.dispatch(findings.get(&a.id).await.unwrap()).await);
        // Second dispatch exceeds the bound while the first is running
        assert!(!orchestrator.dispatch(findings.get(&b.id).await.unwrap()).await);

        orchestrator.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_already_investigated_not_redispatched() {
        let (orchestrator, findings) = orchestrate(
            StubInvestigator::new(InvestigationOutcome::Investigating, false),
            RemediationResult::Unknown,
            2,
            false,
        )
        .await;

        let finding = test_finding("vm/101");
        findings.add(finding.clone()).await;
        findings
            .set_investigation_outcome(&finding.id, InvestigationOutcome::Investigating)
            .await;

        let stored = findings.get(&finding.id).await.unwrap();
        assert!(!orchestrator.dispatch(stored).await);
    }

    #[tokio::test]
    async fn test_lifecycle_events_recorded() {
        let (orchestrator, findings) = orchestrate(
            StubInvestigator::new(InvestigationOutcome::Remediating, false),
            RemediationResult::Unknown,
            2,
            false,
        )
        .await;

        let finding = test_finding("vm/101");
        findings.add(finding.clone()).await;
        orchestrator
            .dispatch(findings.get(&finding.id).await.unwrap())
            .await;
        orchestrator.shutdown(Duration::from_secs(1)).await;

        let after = findings.get(&finding.id).await.unwrap();
        let kinds: Vec<LifecycleEventKind> = after.lifecycle.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&LifecycleEventKind::InvestigationStarted));
        assert!(kinds.contains(&LifecycleEventKind::InvestigationCompleted));
        assert_eq!(after.loop_state, LoopState::Remediating);
    }
}
