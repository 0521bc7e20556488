//! Event-driven patrol triggers
//!
//! Converts external events (alerts firing or clearing, anomalies, manual
//! requests) into scoped patrol requests. A bounded queue absorbs bursts;
//! duplicates within a short window are coalesced; a single worker hands
//! scopes to the engine and retries while a run is active, dropping the
//! trigger after the retry budget.

use crate::models::{PatrolScope, PatrolType, ScopeDepth};
use crate::observability::PatrolMetrics;
use crate::providers::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default cap on queued triggers
const DEFAULT_MAX_PENDING: usize = 64;

/// Window within which identical triggers are coalesced
const DEDUP_WINDOW: Duration = Duration::from_secs(30);

/// Attempts while the engine is busy before a trigger is dropped
const RETRY_BUDGET: u32 = 3;

/// Default delay between busy retries
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Cap on remembered trigger states
const MAX_TRACKED_STATES: usize = 256;

/// What raised a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    AlertFired,
    AlertCleared,
    Anomaly,
    Manual,
}

impl TriggerKind {
    fn patrol_type(&self) -> PatrolType {
        match self {
            TriggerKind::Manual => PatrolType::Manual,
            _ => PatrolType::Event,
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerKind::AlertFired => write!(f, "alert_fired"),
            TriggerKind::AlertCleared => write!(f, "alert_cleared"),
            TriggerKind::Anomaly => write!(f, "anomaly"),
            TriggerKind::Manual => write!(f, "manual"),
        }
    }
}

/// An incoming patrol trigger
#[derive(Debug, Clone)]
pub struct PatrolTrigger {
    pub kind: TriggerKind,
    pub resource_ids: BTreeSet<String>,
    pub resource_types: BTreeSet<String>,
    pub reason: String,
    pub context: String,
    pub depth: ScopeDepth,
}

impl PatrolTrigger {
    pub fn new(kind: TriggerKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            resource_ids: BTreeSet::new(),
            resource_types: BTreeSet::new(),
            reason: reason.into(),
            context: String::new(),
            depth: ScopeDepth::Normal,
        }
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_ids.insert(resource_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    fn signature(&self) -> String {
        let ids: Vec<&str> = self.resource_ids.iter().map(String::as_str).collect();
        format!("{}|{}", self.reason, ids.join(","))
    }

    fn scope(&self) -> PatrolScope {
        PatrolScope {
            resource_ids: self.resource_ids.clone(),
            resource_types: self.resource_types.clone(),
            depth: self.depth,
            reason: format!("{}:{}", self.kind, self.reason),
            context: self.context.clone(),
        }
    }
}

/// Per-trigger progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Pending,
    Dispatching,
    Running,
    Done,
    Dropped,
}

/// Capability the worker uses to start a scoped patrol.
/// Returns `false` when a run is already active.
#[async_trait]
pub trait ScopedPatrolRunner: Send + Sync {
    async fn run_scoped_patrol(&self, scope: PatrolScope, patrol_type: PatrolType) -> bool;
}

struct QueuedTrigger {
    id: u64,
    trigger: PatrolTrigger,
}

/// Accepts triggers, coalesces duplicates, and drives the dispatch worker
pub struct TriggerManager {
    tx: mpsc::Sender<QueuedTrigger>,
    rx: Mutex<Option<mpsc::Receiver<QueuedTrigger>>>,
    states: Mutex<(HashMap<u64, TriggerState>, VecDeque<u64>)>,
    recent: Mutex<HashMap<String, Instant>>,
    event_triggers_enabled: AtomicBool,
    next_id: AtomicU64,
    retry_delay: Duration,
    metrics: PatrolMetrics,
}

impl TriggerManager {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MAX_PENDING, DEFAULT_RETRY_DELAY)
    }

    pub fn with_config(max_pending: usize, retry_delay: Duration) -> Self {
        let (tx, rx) = mpsc::channel(max_pending);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            states: Mutex::new((HashMap::new(), VecDeque::new())),
            recent: Mutex::new(HashMap::new()),
            event_triggers_enabled: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            retry_delay,
            metrics: PatrolMetrics::new(),
        }
    }

    /// Drop all but manual triggers when disabled
    pub fn set_event_triggers_enabled(&self, enabled: bool) {
        self.event_triggers_enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "Event-driven patrol triggers toggled");
    }

    /// Enqueue a trigger. Returns its id, or `None` when it was filtered,
    /// coalesced with a recent duplicate, or dropped on overflow.
    pub fn submit(&self, trigger: PatrolTrigger) -> Option<u64> {
        if trigger.kind != TriggerKind::Manual
            && !self.event_triggers_enabled.load(Ordering::SeqCst)
        {
            debug!(reason = %trigger.reason, "Event triggers disabled, dropping");
            return None;
        }

        // Coalesce duplicates: same resource set and reason within the window
        {
            let mut recent = self.recent.lock().unwrap();
            recent.retain(|_, t| t.elapsed() < DEDUP_WINDOW);
            let signature = trigger.signature();
            if recent.contains_key(&signature) {
                debug!(reason = %trigger.reason, "Duplicate trigger coalesced");
                return None;
            }
            recent.insert(signature, Instant::now());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(QueuedTrigger { id, trigger }) {
            Ok(()) => {
                self.set_state(id, TriggerState::Pending);
                Some(id)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Trigger queue full, dropping trigger");
                self.metrics.inc_stream_resync();
                self.metrics.inc_scoped_dropped_final();
                None
            }
            Err(mpsc::error::TrySendError::Closed(_)) => None,
        }
    }

    /// State of a tracked trigger
    pub fn state(&self, id: u64) -> Option<TriggerState> {
        self.states.lock().unwrap().0.get(&id).copied()
    }

    fn set_state(&self, id: u64, state: TriggerState) {
        let mut states = self.states.lock().unwrap();
        if !states.0.contains_key(&id) {
            states.1.push_back(id);
            while states.1.len() > MAX_TRACKED_STATES {
                if let Some(old) = states.1.pop_front() {
                    states.0.remove(&old);
                }
            }
        }
        states.0.insert(id, state);
    }

    /// Run the dispatch worker until shutdown. Panics if called twice.
    pub async fn run(
        self: Arc<Self>,
        runner: Arc<dyn ScopedPatrolRunner>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        let mut rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .expect("trigger worker already started");

        info!("Starting trigger dispatch worker");
        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some(first) = received else { break };

                    // Drain whatever queued up while the worker was away
                    let mut batch = vec![first];
                    while let Ok(more) = rx.try_recv() {
                        batch.push(more);
                    }
                    if batch.len() > 1 {
                        self.metrics.inc_stream_resume();
                    }
                    self.metrics.observe_replay_batch(batch.len());

                    for queued in batch {
                        self.dispatch(queued, runner.as_ref()).await;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down trigger dispatch worker");
                    break;
                }
            }
        }
    }

    async fn dispatch(&self, queued: QueuedTrigger, runner: &dyn ScopedPatrolRunner) {
        self.set_state(queued.id, TriggerState::Dispatching);

        let mut scope = queued.trigger.scope();
        if !scope.normalize() {
            debug!(reason = %scope.reason, "Trigger scope empty after filtering, dropping");
            self.set_state(queued.id, TriggerState::Dropped);
            return;
        }
        let patrol_type = queued.trigger.kind.patrol_type();

        for attempt in 0..RETRY_BUDGET {
            self.set_state(queued.id, TriggerState::Running);
            if runner.run_scoped_patrol(scope.clone(), patrol_type).await {
                self.set_state(queued.id, TriggerState::Done);
                return;
            }

            // A patrol is already active; back off and retry
            self.set_state(queued.id, TriggerState::Pending);
            self.metrics.inc_scoped_dropped();
            debug!(
                reason = %scope.reason,
                attempt = attempt + 1,
                "Engine busy, deferring scoped patrol"
            );
            tokio::time::sleep(self.retry_delay).await;
        }

        warn!(reason = %scope.reason, "Dropping scoped patrol after retry budget");
        self.metrics.inc_scoped_dropped_final();
        self.set_state(queued.id, TriggerState::Dropped);
    }
}

impl Default for TriggerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::broadcast;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingRunner {
        accepted: AtomicBool,
        calls: AtomicUsize,
        scopes: AsyncMutex<Vec<(PatrolScope, PatrolType)>>,
    }

    impl RecordingRunner {
        fn new(accepted: bool) -> Self {
            Self {
                accepted: AtomicBool::new(accepted),
                calls: AtomicUsize::new(0),
                scopes: AsyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ScopedPatrolRunner for RecordingRunner {
        async fn run_scoped_patrol(&self, scope: PatrolScope, patrol_type: PatrolType) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.accepted.load(Ordering::SeqCst) {
                self.scopes.lock().await.push((scope, patrol_type));
                true
            } else {
                false
            }
        }
    }

    fn start_worker(
        manager: &Arc<TriggerManager>,
        runner: &Arc<RecordingRunner>,
    ) -> broadcast::Sender<()> {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(Arc::clone(manager).run(runner.clone() as Arc<dyn ScopedPatrolRunner>, shutdown_rx));
        shutdown_tx
    }

    #[tokio::test]
    async fn test_dispatch_reaches_runner() {
        let manager = Arc::new(TriggerManager::with_config(8, Duration::from_millis(5)));
        let runner = Arc::new(RecordingRunner::new(true));
        let _shutdown = start_worker(&manager, &runner);

        let id = manager
            .submit(
                PatrolTrigger::new(TriggerKind::AlertFired, "high-memory")
                    .with_resource("vm/101")
                    .with_context("memory alert fired"),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(manager.state(id), Some(TriggerState::Done));
        let scopes = runner.scopes.lock().await;
        assert_eq!(scopes.len(), 1);
        assert!(scopes[0].0.resource_ids.contains("vm/101"));
        assert_eq!(scopes[0].0.reason, "alert_fired:high-memory");
        assert_eq!(scopes[0].1, PatrolType::Event);
    }

    #[tokio::test]
    async fn test_duplicate_triggers_coalesced() {
        let manager = Arc::new(TriggerManager::with_config(8, Duration::from_millis(5)));

        let trigger =
            PatrolTrigger::new(TriggerKind::AlertFired, "high-memory").with_resource("vm/101");
        assert!(manager.submit(trigger.clone()).is_some());
        assert!(manager.submit(trigger.clone()).is_none());

        // A different resource set is not a duplicate
        let other =
            PatrolTrigger::new(TriggerKind::AlertFired, "high-memory").with_resource("vm/102");
        assert!(manager.submit(other).is_some());
    }

    #[tokio::test]
    async fn test_event_triggers_toggle() {
        let manager = Arc::new(TriggerManager::with_config(8, Duration::from_millis(5)));
        manager.set_event_triggers_enabled(false);

        let event =
            PatrolTrigger::new(TriggerKind::Anomaly, "cpu-anomaly").with_resource("vm/101");
        assert!(manager.submit(event).is_none());

        let manual = PatrolTrigger::new(TriggerKind::Manual, "operator").with_resource("vm/101");
        assert!(manager.submit(manual).is_some());
    }

    #[tokio::test]
    async fn test_empty_scope_dropped() {
        let manager = Arc::new(TriggerManager::with_config(8, Duration::from_millis(5)));
        let runner = Arc::new(RecordingRunner::new(true));
        let _shutdown = start_worker(&manager, &runner);

        let mut trigger = PatrolTrigger::new(TriggerKind::AlertFired, "whitespace");
        trigger.resource_ids.insert("   ".to_string());
        let id = manager.submit(trigger).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(manager.state(id), Some(TriggerState::Dropped));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_busy_engine_exhausts_retry_budget() {
        let manager = Arc::new(TriggerManager::with_config(8, Duration::from_millis(5)));
        let runner = Arc::new(RecordingRunner::new(false));
        let _shutdown = start_worker(&manager, &runner);

        let id = manager
            .submit(PatrolTrigger::new(TriggerKind::AlertFired, "busy").with_resource("vm/101"))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(manager.state(id), Some(TriggerState::Dropped));
        assert_eq!(runner.calls.load(Ordering::SeqCst), RETRY_BUDGET as usize);
    }

    #[tokio::test]
    async fn test_queue_overflow_drops() {
        // No worker running, so the queue fills
        let manager = Arc::new(TriggerManager::with_config(2, Duration::from_millis(5)));

        for i in 0..2 {
            let t = PatrolTrigger::new(TriggerKind::AlertFired, format!("r{i}"))
                .with_resource(format!("vm/{i}"));
            assert!(manager.submit(t).is_some());
        }
        let overflow = PatrolTrigger::new(TriggerKind::AlertFired, "r9").with_resource("vm/9");
        assert!(manager.submit(overflow).is_none());
    }
}
