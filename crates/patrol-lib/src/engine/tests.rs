use super::*;
use crate::models::{finding_id, FindingCategory, InvestigationOutcome, LifecycleEventKind};
use crate::providers::{
    ChatRequest, ChatResponse, StaticThresholds,
};
use crate::snapshot::{GuestKind, GuestRecord, NodeRecord, StateSnapshot};
use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use tokio::sync::RwLock as AsyncRwLock;

struct MockState {
    snapshot: AsyncRwLock<StateSnapshot>,
    fail: AtomicBool,
}

impl MockState {
    fn new(snapshot: StateSnapshot) -> Self {
        Self {
            snapshot: AsyncRwLock::new(snapshot),
            fail: AtomicBool::new(false),
        }
    }

    async fn set_guest_disk(&self, resource_id: &str, percent: f64) {
        let mut snapshot = self.snapshot.write().await;
        if let Some(g) = snapshot.guests.iter_mut().find(|g| g.id == resource_id) {
            g.disk_percent = percent;
        }
    }
}

#[async_trait]
impl StateProvider for MockState {
    async fn get_state(&self) -> Result<StateSnapshot> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("state backend down");
        }
        Ok(self.snapshot.read().await.clone())
    }
}

enum LlmBehavior {
    Respond(String),
    Fail,
}

struct MockLlm {
    behavior: LlmBehavior,
    calls: AtomicUsize,
}

impl MockLlm {
    fn responding(content: impl Into<String>) -> Self {
        Self {
            behavior: LlmBehavior::Respond(content.into()),
            calls: AtomicUsize::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            behavior: LlmBehavior::Fail,
            calls: AtomicUsize::new(0),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        match &self.behavior {
            LlmBehavior::Respond(content) => Ok(ChatResponse {
                content: content.clone(),
                model: "test-model".to_string(),
                usage: crate::models::TokenUsage {
                    prompt_tokens: 1200,
                    completion_tokens: 150,
                    total_tokens: 1350,
                },
            }),
            LlmBehavior::Fail => anyhow::bail!("provider unavailable"),
        }
    }

    async fn test_connection(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec!["test-model".to_string()])
    }

    fn context_window(&self) -> Option<u32> {
        Some(32_000)
    }
}

fn busy_snapshot() -> StateSnapshot {
    StateSnapshot {
        nodes: vec![NodeRecord {
            id: "node/pve1".to_string(),
            name: "pve1".to_string(),
            cpu_percent: 20.0,
            memory_percent: 40.0,
            ..Default::default()
        }],
        guests: vec![GuestRecord {
            id: "qemu/101".to_string(),
            name: "web01".to_string(),
            node: "pve1".to_string(),
            kind: GuestKind::Vm,
            vmid: 101,
            status: "running".to_string(),
            cpu_percent: 15.0,
            memory_percent: 40.0,
            disk_percent: 91.0,
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn disk_finding_block(percent: u32) -> String {
    format!(
        "<think>the guest disk looks full</think>\n[FINDING]\nSEVERITY: warning\nCATEGORY: capacity\nRESOURCE: qemu/101\nRESOURCE_TYPE: vm\nTITLE: Root disk nearly full\nDESCRIPTION: Root filesystem close to capacity.\nRECOMMENDATION: Clear logs and caches.\nEVIDENCE: disk at {percent}%\n[/FINDING]"
    )
}

fn engine_with(
    state: Arc<MockState>,
    llm: Arc<MockLlm>,
) -> Arc<PatrolEngine> {
    PatrolEngineBuilder::new()
        .thresholds(Arc::new(StaticThresholds::default()))
        .state(state)
        .llm(llm)
        .build()
}

#[tokio::test]
async fn test_gate_without_llm_records_skipped_run() {
    let engine = PatrolEngineBuilder::new()
        .state(Arc::new(MockState::new(busy_snapshot())))
        .build();

    assert!(engine.run_manual().await);

    let record = engine.history().latest().await.unwrap();
    assert_eq!(record.status, RunStatus::Skipped);
    assert_eq!(record.error_count, 0);
}

#[tokio::test]
async fn test_full_run_emits_validated_finding() {
    let state = Arc::new(MockState::new(busy_snapshot()));
    let llm = Arc::new(MockLlm::responding(disk_finding_block(91)));
    let engine = engine_with(state, llm.clone());

    assert!(engine.run_manual().await);

    assert_eq!(llm.call_count(), 1);
    let findings = engine.findings().get_active(Severity::Info).await;
    assert_eq!(findings.len(), 1);
    let f = &findings[0];
    assert_eq!(f.resource_id, "qemu/101");
    assert_eq!(f.resource_name, "web01");
    assert_eq!(f.node, "pve1");
    assert_eq!(f.key, "root-disk-nearly-full");
    assert_eq!(f.severity, Severity::Warning);
    assert_eq!(f.category, FindingCategory::Capacity);
    // The reasoning span never reaches the finding text
    assert!(!f.description.contains("looks full"));

    let record = engine.history().latest().await.unwrap();
    assert_eq!(record.status, RunStatus::IssuesFound);
    assert_eq!(record.new_findings, 1);
    assert_eq!(record.finding_ids, vec![f.id.clone()]);
    assert_eq!(record.usage.total_tokens, 1350);
    assert_eq!(record.model, "test-model");
    assert_eq!(record.checked.guests, 1);
    assert_eq!(record.checked.nodes, 1);

    let status = engine.status();
    assert!(status.healthy);
    assert_eq!(status.last_status, Some(RunStatus::IssuesFound));
}

#[tokio::test]
async fn test_finding_below_threshold_rejected() {
    let state = Arc::new(MockState::new(busy_snapshot()));
    // The model claims 50%, below the 85% disk watch band
    let llm = Arc::new(MockLlm::responding(disk_finding_block(50)));
    let engine = engine_with(state, llm);

    engine.run_manual().await;

    assert!(engine.findings().is_empty().await);
    let record = engine.history().latest().await.unwrap();
    assert_eq!(record.rejected_findings, 1);
    assert_eq!(record.new_findings, 0);
    assert_eq!(record.status, RunStatus::Ok);
}

#[tokio::test]
async fn test_quiet_triage_skips_llm_on_scheduled_run() {
    let mut calm = busy_snapshot();
    calm.guests[0].disk_percent = 20.0;
    let state = Arc::new(MockState::new(calm));
    let llm = Arc::new(MockLlm::responding(disk_finding_block(91)));
    let engine = engine_with(state, llm.clone());

    engine.run_scheduled().await;

    assert_eq!(llm.call_count(), 0);
    let record = engine.history().latest().await.unwrap();
    assert_eq!(record.status, RunStatus::Ok);
    assert!(record.findings_summary.contains("triage quiet"));
}

#[tokio::test]
async fn test_manual_run_reaches_llm_even_when_quiet() {
    let mut calm = busy_snapshot();
    calm.guests[0].disk_percent = 20.0;
    let state = Arc::new(MockState::new(calm));
    let llm = Arc::new(MockLlm::responding("no findings".to_string()));
    let engine = engine_with(state, llm.clone());

    engine.run_manual().await;

    assert_eq!(llm.call_count(), 1);
}

#[tokio::test]
async fn test_sync_resolves_recovered_findings() {
    let state = Arc::new(MockState::new(busy_snapshot()));
    let llm = Arc::new(MockLlm::responding(disk_finding_block(91)));
    let engine = engine_with(state.clone(), llm);

    engine.run_manual().await;
    assert_eq!(engine.findings().get_active(Severity::Info).await.len(), 1);

    // Disk usage recovers; the next run resolves the finding
    state.set_guest_disk("qemu/101", 30.0).await;
    engine.run_manual().await;

    let active = engine.findings().get_active(Severity::Info).await;
    assert!(active.is_empty());
    let record = engine.history().latest().await.unwrap();
    assert_eq!(record.resolved_findings, 1);

    let id = finding_id("qemu/101", "root-disk-nearly-full");
    let resolved = engine.findings().get(&id).await.unwrap();
    assert!(resolved.resolved_at.is_some());
    assert_eq!(
        resolved.lifecycle.last().unwrap().kind,
        LifecycleEventKind::Resolved
    );
}

#[tokio::test]
async fn test_llm_failure_marks_run_error_and_opens_circuit() {
    let state = Arc::new(MockState::new(busy_snapshot()));
    let llm = Arc::new(MockLlm::failing());
    let engine = engine_with(state, llm.clone());

    // Five consecutive failures trip the default breaker
    for _ in 0..5 {
        engine.run_manual().await;
    }
    let record = engine.history().latest().await.unwrap();
    assert_eq!(record.status, RunStatus::Error);
    assert_eq!(record.error_count, 1);
    assert!(!engine.status().healthy);

    // The sixth run is blocked by the open circuit, without an LLM call
    let calls_before = llm.call_count();
    engine.run_manual().await;
    assert_eq!(llm.call_count(), calls_before);
    let record = engine.history().latest().await.unwrap();
    assert_eq!(record.status, RunStatus::Skipped);
    assert!(record.findings_summary.contains("circuit"));
}

#[tokio::test]
async fn test_state_error_marks_run_error() {
    let state = Arc::new(MockState::new(busy_snapshot()));
    state.fail.store(true, Ordering::SeqCst);
    let llm = Arc::new(MockLlm::responding("ok".to_string()));
    let engine = engine_with(state, llm);

    engine.run_manual().await;

    let record = engine.history().latest().await.unwrap();
    assert_eq!(record.status, RunStatus::Error);
    assert_eq!(record.error_count, 1);
}

#[tokio::test]
async fn test_scoped_patrol_rejected_while_busy() {
    use crate::trigger::ScopedPatrolRunner;

    let state = Arc::new(MockState::new(busy_snapshot()));
    let llm = Arc::new(MockLlm::responding(disk_finding_block(91)));
    let engine = engine_with(state, llm);

    // Hold the run gate to simulate an in-flight patrol
    let gate = engine.run_gate.lock().await;
    let scope = PatrolScope {
        resource_ids: ["qemu/101".to_string()].into_iter().collect(),
        reason: "alert_fired:high-disk".to_string(),
        ..Default::default()
    };
    assert!(!engine.run_scoped_patrol(scope.clone(), PatrolType::Event).await);
    drop(gate);

    assert!(engine.run_scoped_patrol(scope, PatrolType::Event).await);
    let record = engine.history().latest().await.unwrap();
    assert_eq!(record.patrol_type, PatrolType::Event);
}

#[tokio::test]
async fn test_scoped_patrol_limits_seed_to_scope() {
    let mut snapshot = busy_snapshot();
    // A second guest is also over threshold but outside the scope
    snapshot.guests.push(GuestRecord {
        id: "qemu/102".to_string(),
        name: "db01".to_string(),
        node: "pve1".to_string(),
        kind: GuestKind::Vm,
        vmid: 102,
        status: "running".to_string(),
        disk_percent: 95.0,
        ..Default::default()
    });
    let state = Arc::new(MockState::new(snapshot));
    let llm = Arc::new(MockLlm::responding("nothing".to_string()));
    let engine = engine_with(state, llm);

    use crate::trigger::ScopedPatrolRunner;
    let scope = PatrolScope {
        resource_ids: ["qemu/101".to_string()].into_iter().collect(),
        reason: "alert_fired:high-disk".to_string(),
        ..Default::default()
    };
    assert!(engine.run_scoped_patrol(scope, PatrolType::Event).await);
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let state = Arc::new(MockState::new(busy_snapshot()));
    let llm = Arc::new(MockLlm::responding("nothing".to_string()));
    let engine = engine_with(state, llm);

    assert!(engine.start());
    assert!(!engine.start());
    engine.stop();
}

#[tokio::test]
async fn test_verify_fix_against_live_state() {
    use crate::investigation::FixVerifier;
    use crate::logs::RemediationResult;

    let state = Arc::new(MockState::new(busy_snapshot()));
    let llm = Arc::new(MockLlm::responding(disk_finding_block(91)));
    let engine = engine_with(state.clone(), llm);
    engine.run_manual().await;

    let id = finding_id("qemu/101", "root-disk-nearly-full");
    let finding = engine.findings().get(&id).await.unwrap();

    // Disk still full: the fix did not hold
    assert_eq!(engine.verify_fix(&finding).await, RemediationResult::Failed);

    // Disk recovered: verified
    state.set_guest_disk("qemu/101", 30.0).await;
    assert_eq!(
        engine.verify_fix(&finding).await,
        RemediationResult::Resolved
    );
}

#[tokio::test]
async fn test_investigations_dispatched_for_eligible_findings() {
    use crate::investigation::{
        InvestigationOrchestrator, InvestigationReport, Investigator,
    };

    struct CountingInvestigator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Investigator for CountingInvestigator {
        async fn investigate(&self, _finding: &Finding) -> Result<InvestigationReport> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(InvestigationReport {
                outcome: InvestigationOutcome::ManualRequired,
                summary: "needs an operator".to_string(),
                requires_approval: false,
            })
        }
    }

    let state = Arc::new(MockState::new(busy_snapshot()));
    let llm = Arc::new(MockLlm::responding(disk_finding_block(91)));
    let engine = engine_with(state, llm);

    let investigator = Arc::new(CountingInvestigator {
        calls: AtomicUsize::new(0),
    });
    let orchestrator = Arc::new(InvestigationOrchestrator::new(
        investigator.clone(),
        Arc::clone(&engine) as Arc<dyn crate::investigation::FixVerifier>,
        engine.findings(),
    ));
    engine.set_investigation_orchestrator(orchestrator.clone());

    engine.run_manual().await;
    orchestrator.shutdown(std::time::Duration::from_secs(1)).await;

    assert_eq!(investigator.calls.load(AtomicOrdering::SeqCst), 1);
    let id = finding_id("qemu/101", "root-disk-nearly-full");
    let finding = engine.findings().get(&id).await.unwrap();
    assert_eq!(
        finding.investigation_outcome,
        InvestigationOutcome::ManualRequired
    );
}

#[tokio::test]
async fn test_unified_sink_receives_emitted_findings() {
    let state = Arc::new(MockState::new(busy_snapshot()));
    let llm = Arc::new(MockLlm::responding(disk_finding_block(91)));
    let engine = engine_with(state, llm);

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    engine.set_unified_sink(Arc::new(move |f: &Finding| {
        seen_clone.lock().unwrap().push(f.id.clone());
    }));

    engine.run_manual().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], finding_id("qemu/101", "root-disk-nearly-full"));
}
