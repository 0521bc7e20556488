//! Findings store
//!
//! Keyed store of patrol findings with:
//! - Deduplication on `(resource_id, key)`: re-adding refreshes the record
//! - Regression tracking when a resolved finding reappears
//! - Loop-state transitions guarded against regressing a resolved finding
//! - Debounced persistence through an injected port with a save-error callback

use crate::models::{
    finding_id, Finding, InvestigationOutcome, LifecycleEvent, LifecycleEventKind, LoopState,
    Severity,
};
use crate::providers::FindingsPersistence;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Default debounce before a mutation is flushed to the persistence port
const DEFAULT_SAVE_DEBOUNCE: Duration = Duration::from_secs(1);

/// Default cap on stored findings; trimmed on insert, resolved-oldest first
const DEFAULT_MAX_RECORDS: usize = 2_000;

/// Callback invoked when a persistence save fails
pub type SaveErrorCallback = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

#[derive(Default)]
struct Inner {
    findings: HashMap<String, Finding>,
}

struct SaveState {
    pending: AtomicBool,
    last_save: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    on_error: RwLock<Option<SaveErrorCallback>>,
}

/// Outcome of adding a finding to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Created,
    Refreshed,
    Regressed,
}

/// Keyed store of findings with lifecycle tracking and debounced persistence
pub struct FindingsStore {
    inner: Arc<RwLock<Inner>>,
    persistence: Arc<RwLock<Option<Arc<dyn FindingsPersistence>>>>,
    save_state: Arc<SaveState>,
    save_debounce: Duration,
    max_records: usize,
}

impl FindingsStore {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_RECORDS, DEFAULT_SAVE_DEBOUNCE)
    }

    pub fn with_limits(max_records: usize, save_debounce: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            persistence: Arc::new(RwLock::new(None)),
            save_state: Arc::new(SaveState {
                pending: AtomicBool::new(false),
                last_save: RwLock::new(None),
                last_error: RwLock::new(None),
                on_error: RwLock::new(None),
            }),
            save_debounce,
            max_records,
        }
    }

    /// Add a finding, deduplicating on `(resource_id, key)`.
    /// Returns `true` when a new record was created.
    pub async fn add(&self, finding: Finding) -> bool {
        self.add_detailed(finding).await == AddOutcome::Created
    }

    /// Add a finding and report which path it took
    pub async fn add_detailed(&self, mut finding: Finding) -> AddOutcome {
        finding.id = finding_id(&finding.resource_id, &finding.key);
        let id = finding.id.clone();

        let outcome = {
            let mut inner = self.inner.write().await;
            let now = Utc::now();

            match inner.findings.get_mut(&id) {
                Some(existing) if existing.resolved_at.is_some() => {
                    // A previously-resolved finding is back: regression
                    existing.severity = finding.severity;
                    existing.category = finding.category;
                    existing.title = finding.title;
                    existing.description = finding.description;
                    existing.recommendation = finding.recommendation;
                    existing.evidence = finding.evidence;
                    existing.last_seen_at = now;
                    existing.times_raised += 1;
                    existing.regression_count += 1;
                    existing.last_regression_at = Some(now);
                    existing.resolved_at = None;
                    existing.loop_state = LoopState::Detected;
                    existing.investigation_outcome = InvestigationOutcome::None;
                    existing.lifecycle.push(LifecycleEvent::with_detail(
                        LifecycleEventKind::Regressed,
                        format!("regression #{}", existing.regression_count),
                    ));
                    AddOutcome::Regressed
                }
                Some(existing) => {
                    existing.severity = finding.severity;
                    existing.category = finding.category;
                    existing.title = finding.title;
                    existing.description = finding.description;
                    existing.recommendation = finding.recommendation;
                    existing.evidence = finding.evidence;
                    existing.last_seen_at = now;
                    existing.times_raised += 1;
                    existing
                        .lifecycle
                        .push(LifecycleEvent::now(LifecycleEventKind::Reseen));
                    AddOutcome::Refreshed
                }
                None => {
                    finding
                        .lifecycle
                        .push(LifecycleEvent::now(LifecycleEventKind::Detected));
                    inner.findings.insert(id.clone(), finding);
                    Self::trim_locked(&mut inner, self.max_records);
                    AddOutcome::Created
                }
            }
        };

        match outcome {
            AddOutcome::Created => debug!(finding_id = %id, "Finding created"),
            AddOutcome::Refreshed => debug!(finding_id = %id, "Finding refreshed"),
            AddOutcome::Regressed => {
                warn!(finding_id = %id, "Resolved finding regressed")
            }
        }

        self.schedule_save();
        outcome
    }

    /// Resolve a finding. Idempotent: resolving an already-resolved finding
    /// returns `false` and records nothing.
    pub async fn resolve(&self, id: &str, manual: bool) -> bool {
        let resolved = {
            let mut inner = self.inner.write().await;
            match inner.findings.get_mut(id) {
                Some(f) if f.resolved_at.is_none() => {
                    f.resolved_at = Some(Utc::now());
                    f.loop_state = if manual {
                        LoopState::Manual
                    } else {
                        LoopState::Resolved
                    };
                    f.lifecycle.push(LifecycleEvent::with_detail(
                        LifecycleEventKind::Resolved,
                        if manual { "manual" } else { "verified" },
                    ));
                    true
                }
                _ => false,
            }
        };

        if resolved {
            info!(finding_id = %id, manual, "Finding resolved");
            self.schedule_save();
        }
        resolved
    }

    /// Record the investigation outcome and derive the loop state from it.
    /// A derived state that would move a resolved finding backwards records a
    /// violation event and leaves the state unchanged.
    pub async fn set_investigation_outcome(&self, id: &str, outcome: InvestigationOutcome) -> bool {
        let mut inner = self.inner.write().await;
        let Some(f) = inner.findings.get_mut(id) else {
            return false;
        };
        f.investigation_outcome = outcome;
        Self::sync_loop_state_locked(f);
        drop(inner);

        self.schedule_save();
        true
    }

    fn sync_loop_state_locked(f: &mut Finding) {
        let next = f.investigation_outcome.derived_loop_state();
        if next == f.loop_state {
            return;
        }
        if f.loop_state == LoopState::Resolved && next.rank() < f.loop_state.rank() {
            f.lifecycle.push(LifecycleEvent::with_detail(
                LifecycleEventKind::LoopTransitionViolation,
                format!("resolved -> {next} rejected"),
            ));
            return;
        }
        f.lifecycle.push(LifecycleEvent::with_detail(
            LifecycleEventKind::LoopTransition,
            format!("{} -> {next}", f.loop_state),
        ));
        f.loop_state = next;
    }

    /// Append a lifecycle event without changing other fields
    pub async fn record_event(&self, id: &str, event: LifecycleEvent) -> bool {
        let mut inner = self.inner.write().await;
        match inner.findings.get_mut(id) {
            Some(f) => {
                f.lifecycle.push(event);
                true
            }
            None => false,
        }
    }

    /// Copy of a finding by id
    pub async fn get(&self, id: &str) -> Option<Finding> {
        self.inner.read().await.findings.get(id).cloned()
    }

    /// All findings at or above a severity, newest-seen first
    pub async fn get_all(&self, min_severity: Severity) -> Vec<Finding> {
        let inner = self.inner.read().await;
        let mut out: Vec<Finding> = inner
            .findings
            .values()
            .filter(|f| f.severity >= min_severity)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        out
    }

    /// Unresolved findings at or above a severity, newest-seen first
    pub async fn get_active(&self, min_severity: Severity) -> Vec<Finding> {
        let inner = self.inner.read().await;
        let mut out: Vec<Finding> = inner
            .findings
            .values()
            .filter(|f| f.is_active() && f.severity >= min_severity)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        out
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.findings.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.findings.is_empty()
    }

    /// Wire a persistence port, loading previously saved findings first.
    /// A load failure starts the store empty; it is reported, not fatal.
    pub async fn set_persistence(&self, port: Arc<dyn FindingsPersistence>) {
        match port.load_findings().await {
            Ok(loaded) => {
                let mut inner = self.inner.write().await;
                for f in loaded {
                    inner.findings.insert(f.id.clone(), f);
                }
                info!(count = inner.findings.len(), "Loaded persisted findings");
            }
            Err(e) => warn!(error = %e, "Failed to load persisted findings, starting fresh"),
        }
        *self.persistence.write().await = Some(port);
    }

    /// Register the callback invoked when a save fails
    pub async fn set_save_error_callback(&self, cb: SaveErrorCallback) {
        *self.save_state.on_error.write().await = Some(cb);
    }

    /// Time of the last successful save; `None` until one succeeds
    pub async fn last_save_time(&self) -> Option<DateTime<Utc>> {
        *self.save_state.last_save.read().await
    }

    /// Message of the last failed save, if any
    pub async fn last_save_error(&self) -> Option<String> {
        self.save_state.last_error.read().await.clone()
    }

    /// Coalesce mutations into one save per debounce window
    fn schedule_save(&self) {
        if self.save_state.pending.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let persistence = Arc::clone(&self.persistence);
        let save_state = Arc::clone(&self.save_state);
        let debounce = self.save_debounce;

        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            save_state.pending.store(false, Ordering::SeqCst);

            let port = match persistence.read().await.as_ref() {
                Some(p) => Arc::clone(p),
                None => return,
            };
            let snapshot: Vec<Finding> = inner.read().await.findings.values().cloned().collect();

            match port.save_findings(&snapshot).await {
                Ok(()) => {
                    *save_state.last_save.write().await = Some(Utc::now());
                    *save_state.last_error.write().await = None;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to persist findings");
                    *save_state.last_error.write().await = Some(e.to_string());
                    if let Some(cb) = save_state.on_error.read().await.as_ref() {
                        cb(&e);
                    }
                }
            }
        });
    }

    /// Drop resolved findings oldest-first, then oldest unresolved, until
    /// the store fits the cap again
    fn trim_locked(inner: &mut Inner, max_records: usize) {
        while inner.findings.len() > max_records {
            let victim = inner
                .findings
                .values()
                .min_by_key(|f| (f.is_active(), f.last_seen_at))
                .map(|f| f.id.clone());
            match victim {
                Some(id) => {
                    inner.findings.remove(&id);
                }
                None => break,
            }
        }
    }
}

impl Default for FindingsStore {
    fn default() -> Self {
        Self::new()
    }
}
