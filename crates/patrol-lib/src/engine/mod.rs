//! Patrol engine
//!
//! Owns the patrol loop: a single scheduler task ticks at the configured
//! interval, and event triggers request scoped runs between ticks. Exactly
//! one patrol is active at any time; the engine owns the findings store and
//! run history exclusively and reaches every external system through an
//! injected provider trait (a missing provider turns the feature off).

pub mod parse;
pub mod seed;
pub mod triage;

mod run;

#[cfg(test)]
mod tests;

use crate::baseline::BaselineStore;
use crate::circuit::CircuitBreaker;
use crate::correlation::CorrelationDetector;
use crate::findings::FindingsStore;
use crate::history::RunHistoryStore;
use crate::investigation::{FixVerifier, InvestigationOrchestrator};
use crate::logs::{ChangeLog, RemediationLog, RemediationResult};
use crate::models::{Finding, PatrolScope, PatrolType, RunStatus, Severity};
use crate::observability::{PatrolLogger, PatrolMetrics};
use crate::providers::{
    async_trait, AgentExecutor, AlertManagerAdapter, FindingResolver, LlmProvider,
    MetricsHistoryProvider, StateProvider, ThresholdProvider,
};
use crate::runbook::{builtin_catalog, Runbook, RunbookExecutor};
use crate::thresholds::{PatrolThresholds, ThresholdMode};
use crate::trigger::ScopedPatrolRunner as TriggerRunner;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info};

/// Default scheduled patrol interval
const DEFAULT_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Default per-LLM-call timeout
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(45);

/// Default confidence floor for correlation-driven scope expansion
const DEFAULT_CONFIDENCE_FLOOR: f64 = 0.5;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub threshold_mode: ThresholdMode,
    pub llm_timeout: Duration,
    /// Auto-apply low-risk runbooks after each run
    pub auto_fix: bool,
    /// Confidence floor for correlation-driven scope expansion
    pub correlation_confidence_floor: f64,
    /// Marker pairs stripped from provider output before parsing
    pub reasoning_markers: Vec<(String, String)>,
    /// Preferred model; empty lets the provider choose
    pub model: String,
    /// Instance label carried in structured logs
    pub instance: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_INTERVAL,
            threshold_mode: ThresholdMode::Exact,
            llm_timeout: DEFAULT_LLM_TIMEOUT,
            auto_fix: false,
            correlation_confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
            reasoning_markers: parse::default_reasoning_markers(),
            model: String::new(),
            instance: "patrol".to_string(),
        }
    }
}

/// Observable engine status
#[derive(Debug, Clone, Default, Serialize)]
pub struct PatrolStatus {
    pub last_run_id: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
    pub last_error_count: usize,
    pub last_triage_flags: usize,
    pub runs_completed: u64,
    /// Last run succeeded with no errors
    pub healthy: bool,
    pub in_flight: bool,
}

/// The patrol engine. Construct through [`PatrolEngineBuilder`].
pub struct PatrolEngine {
    pub(crate) config: RwLock<EngineConfig>,

    // Owned stores
    pub(crate) findings: Arc<FindingsStore>,
    pub(crate) history: Arc<RunHistoryStore>,

    // Shared read-mostly state
    pub(crate) baselines: Arc<BaselineStore>,
    pub(crate) correlation: Arc<CorrelationDetector>,
    pub(crate) patterns: Arc<crate::patterns::PatternDetector>,
    pub(crate) change_log: Arc<ChangeLog>,
    pub(crate) remediation_log: Arc<RemediationLog>,

    // Providers; None means the feature is off
    pub(crate) threshold_provider: Option<Arc<dyn ThresholdProvider>>,
    pub(crate) state_provider: Option<Arc<dyn StateProvider>>,
    pub(crate) llm: Option<Arc<dyn LlmProvider>>,
    pub(crate) metrics_history: Option<Arc<dyn MetricsHistoryProvider>>,
    pub(crate) alert_manager: Option<Arc<dyn AlertManagerAdapter>>,
    pub(crate) runbook_executor: Option<Arc<RunbookExecutor>>,
    pub(crate) catalog: Vec<Runbook>,

    pub(crate) circuit: CircuitBreaker,
    pub(crate) thresholds: RwLock<PatrolThresholds>,
    pub(crate) status: RwLock<PatrolStatus>,

    orchestrator: RwLock<Option<Arc<InvestigationOrchestrator>>>,
    unified_sink: RwLock<Option<Arc<dyn Fn(&Finding) + Send + Sync>>>,

    /// One patrol at a time
    pub(crate) run_gate: Mutex<()>,
    started: AtomicBool,
    stop_tx: broadcast::Sender<()>,
    interval_tx: watch::Sender<Duration>,

    pub(crate) metrics: PatrolMetrics,
    pub(crate) logger: PatrolLogger,
}

/// Builder wiring providers into a [`PatrolEngine`]
pub struct PatrolEngineBuilder {
    config: EngineConfig,
    threshold_provider: Option<Arc<dyn ThresholdProvider>>,
    state_provider: Option<Arc<dyn StateProvider>>,
    llm: Option<Arc<dyn LlmProvider>>,
    metrics_history: Option<Arc<dyn MetricsHistoryProvider>>,
    alert_manager: Option<Arc<dyn AlertManagerAdapter>>,
    agent_executor: Option<Arc<dyn AgentExecutor>>,
    findings: Option<Arc<FindingsStore>>,
    history: Option<Arc<RunHistoryStore>>,
}

impl PatrolEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            threshold_provider: None,
            state_provider: None,
            llm: None,
            metrics_history: None,
            alert_manager: None,
            agent_executor: None,
            findings: None,
            history: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn thresholds(mut self, provider: Arc<dyn ThresholdProvider>) -> Self {
        self.threshold_provider = Some(provider);
        self
    }

    pub fn state(mut self, provider: Arc<dyn StateProvider>) -> Self {
        self.state_provider = Some(provider);
        self
    }

    pub fn llm(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(provider);
        self
    }

    pub fn metrics_history(mut self, provider: Arc<dyn MetricsHistoryProvider>) -> Self {
        self.metrics_history = Some(provider);
        self
    }

    pub fn alert_manager(mut self, adapter: Arc<dyn AlertManagerAdapter>) -> Self {
        self.alert_manager = Some(adapter);
        self
    }

    pub fn agent_executor(mut self, executor: Arc<dyn AgentExecutor>) -> Self {
        self.agent_executor = Some(executor);
        self
    }

    /// Use a pre-built findings store (e.g. one with persistence wired)
    pub fn findings_store(mut self, store: Arc<FindingsStore>) -> Self {
        self.findings = Some(store);
        self
    }

    pub fn history_store(mut self, store: Arc<RunHistoryStore>) -> Self {
        self.history = Some(store);
        self
    }

    pub fn build(self) -> Arc<PatrolEngine> {
        let findings = self.findings.unwrap_or_else(|| Arc::new(FindingsStore::new()));
        let history = self.history.unwrap_or_else(|| Arc::new(RunHistoryStore::new()));
        let remediation_log = Arc::new(RemediationLog::new());
        let logger = PatrolLogger::new(self.config.instance.clone());

        let thresholds = match &self.threshold_provider {
            Some(provider) => {
                PatrolThresholds::derive(provider.as_ref(), self.config.threshold_mode)
            }
            None => PatrolThresholds::derive(
                &crate::providers::StaticThresholds::default(),
                self.config.threshold_mode,
            ),
        };

        // Runbooks resolve findings through a narrow store-backed capability
        let runbook_executor = self.agent_executor.map(|executor| {
            Arc::new(RunbookExecutor::new(
                executor,
                Arc::new(StoreResolver {
                    findings: Arc::clone(&findings),
                    logger: logger.clone(),
                }),
                Arc::clone(&remediation_log),
            ))
        });

        let (stop_tx, _) = broadcast::channel(1);
        let (interval_tx, _) = watch::channel(self.config.interval);

        Arc::new(PatrolEngine {
            config: RwLock::new(self.config),
            findings,
            history,
            baselines: Arc::new(BaselineStore::new()),
            correlation: Arc::new(CorrelationDetector::new()),
            patterns: Arc::new(crate::patterns::PatternDetector::new()),
            change_log: Arc::new(ChangeLog::new()),
            remediation_log,
            threshold_provider: self.threshold_provider,
            state_provider: self.state_provider,
            llm: self.llm,
            metrics_history: self.metrics_history,
            alert_manager: self.alert_manager,
            runbook_executor,
            catalog: builtin_catalog(),
            circuit: CircuitBreaker::default(),
            thresholds: RwLock::new(thresholds),
            status: RwLock::new(PatrolStatus::default()),
            orchestrator: RwLock::new(None),
            unified_sink: RwLock::new(None),
            run_gate: Mutex::new(()),
            started: AtomicBool::new(false),
            stop_tx,
            interval_tx,
            metrics: PatrolMetrics::new(),
            logger,
        })
    }
}

impl Default for PatrolEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PatrolEngine {
    /// Start the scheduler task. Idempotent: returns `false` without
    /// spawning anything when already started.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Patrol engine already started");
            return false;
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.scheduler_loop().await });
        true
    }

    /// Signal the scheduler to stop; the current run finishes its step first
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    /// Change the scheduled interval; the ticker resets without racing the
    /// running scheduler.
    pub fn set_interval(&self, interval: Duration) {
        self.config.write().unwrap().interval = interval;
        let _ = self.interval_tx.send(interval);
    }

    /// Switch threshold mode and re-derive the bands. Existing findings are
    /// untouched.
    pub fn set_threshold_mode(&self, mode: ThresholdMode) {
        self.config.write().unwrap().threshold_mode = mode;
        self.refresh_thresholds();
    }

    /// Wire the investigation orchestrator after construction
    pub fn set_investigation_orchestrator(&self, orchestrator: Arc<InvestigationOrchestrator>) {
        *self.orchestrator.write().unwrap() = Some(orchestrator);
    }

    /// Callback pushing emitted findings to a unified store
    pub fn set_unified_sink(&self, sink: Arc<dyn Fn(&Finding) + Send + Sync>) {
        *self.unified_sink.write().unwrap() = Some(sink);
    }

    pub fn findings(&self) -> Arc<FindingsStore> {
        Arc::clone(&self.findings)
    }

    pub fn history(&self) -> Arc<RunHistoryStore> {
        Arc::clone(&self.history)
    }

    pub fn correlation(&self) -> Arc<CorrelationDetector> {
        Arc::clone(&self.correlation)
    }

    pub fn baselines(&self) -> Arc<BaselineStore> {
        Arc::clone(&self.baselines)
    }

    pub fn change_log(&self) -> Arc<ChangeLog> {
        Arc::clone(&self.change_log)
    }

    pub fn remediation_log(&self) -> Arc<RemediationLog> {
        Arc::clone(&self.remediation_log)
    }

    pub fn status(&self) -> PatrolStatus {
        self.status.read().unwrap().clone()
    }

    pub fn current_thresholds(&self) -> PatrolThresholds {
        *self.thresholds.read().unwrap()
    }

    pub(crate) fn orchestrator(&self) -> Option<Arc<InvestigationOrchestrator>> {
        self.orchestrator.read().unwrap().clone()
    }

    pub(crate) fn unified_sink(&self) -> Option<Arc<dyn Fn(&Finding) + Send + Sync>> {
        self.unified_sink.read().unwrap().clone()
    }

    /// Re-derive thresholds from the provider under the configured mode
    pub(crate) fn refresh_thresholds(&self) {
        let mode = self.config.read().unwrap().threshold_mode;
        if let Some(provider) = &self.threshold_provider {
            let derived = PatrolThresholds::derive(provider.as_ref(), mode);
            *self.thresholds.write().unwrap() = derived;
        }
    }

    async fn scheduler_loop(self: Arc<Self>) {
        let mut stop = self.stop_tx.subscribe();
        let mut interval_rx = self.interval_tx.subscribe();
        let mut ticker = tokio::time::interval(*interval_rx.borrow());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately; consume it
        // so patrols start one period after startup.
        ticker.tick().await;

        info!(
            interval_secs = self.config.read().unwrap().interval.as_secs(),
            "Starting patrol scheduler"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_scheduled().await;
                }
                changed = interval_rx.changed() => {
                    if changed.is_ok() {
                        let period = *interval_rx.borrow();
                        info!(interval_secs = period.as_secs(), "Patrol interval changed");
                        ticker = tokio::time::interval(period);
                        ticker
                            .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                        ticker.tick().await;
                    }
                }
                _ = stop.recv() => {
                    info!("Shutting down patrol scheduler");
                    break;
                }
            }
        }
    }

    /// Run one scheduled (full-coverage) patrol if none is active
    pub async fn run_scheduled(&self) {
        let Ok(_guard) = self.run_gate.try_lock() else {
            debug!("Patrol already active, skipping scheduled tick");
            return;
        };
        self.set_in_flight(true);
        self.execute_run(PatrolType::Scheduled, None).await;
        self.set_in_flight(false);
    }

    /// Run a manual full patrol immediately. Returns `false` when a run is
    /// already active.
    pub async fn run_manual(&self) -> bool {
        let Ok(_guard) = self.run_gate.try_lock() else {
            return false;
        };
        self.set_in_flight(true);
        self.execute_run(PatrolType::Manual, None).await;
        self.set_in_flight(false);
        true
    }

    fn set_in_flight(&self, in_flight: bool) {
        self.status.write().unwrap().in_flight = in_flight;
    }
}

#[async_trait]
impl TriggerRunner for PatrolEngine {
    async fn run_scoped_patrol(&self, scope: PatrolScope, patrol_type: PatrolType) -> bool {
        let Ok(_guard) = self.run_gate.try_lock() else {
            return false;
        };
        self.set_in_flight(true);
        self.execute_run(patrol_type, Some(scope)).await;
        self.set_in_flight(false);
        true
    }
}

#[async_trait]
impl FindingResolver for PatrolEngine {
    async fn resolve_finding(&self, finding_id: &str, note: &str) -> bool {
        let resolved = self.findings.resolve(finding_id, false).await;
        if resolved {
            self.logger.log_finding_resolved(finding_id, "", note);
        }
        resolved
    }
}

#[async_trait]
impl FixVerifier for PatrolEngine {
    /// Verify a fix against live telemetry: the finding's metric must be
    /// back under its watch threshold.
    async fn verify_fix(&self, finding: &Finding) -> RemediationResult {
        let Some(provider) = &self.state_provider else {
            return RemediationResult::Unknown;
        };
        let Ok(mut snapshot) = provider.get_state().await else {
            return RemediationResult::Unknown;
        };
        snapshot.normalize();

        let Some(metric) = run::metric_for_key(&finding.key) else {
            return RemediationResult::Unknown;
        };
        let Some(value) = run::current_metric(&snapshot, &finding.resource_id, metric) else {
            return RemediationResult::Unknown;
        };
        let thresholds = self.current_thresholds();
        match thresholds.watch_for(&finding.resource_type, metric) {
            Some(watch) if value < watch => RemediationResult::Resolved,
            Some(_) => RemediationResult::Failed,
            None => RemediationResult::Unknown,
        }
    }
}

/// Store-backed implementation of the finding-resolution capability handed
/// to the runbook executor
struct StoreResolver {
    findings: Arc<FindingsStore>,
    logger: PatrolLogger,
}

#[async_trait]
impl FindingResolver for StoreResolver {
    async fn resolve_finding(&self, finding_id: &str, note: &str) -> bool {
        let resolved = self.findings.resolve(finding_id, false).await;
        if resolved {
            self.logger.log_finding_resolved(finding_id, "", note);
        }
        resolved
    }
}

/// Findings the engine considers eligible for investigation
pub(crate) fn investigation_eligible(finding: &Finding) -> bool {
    finding.is_active()
        && finding.severity >= Severity::Warning
        && finding.investigation_outcome == crate::models::InvestigationOutcome::None
}
