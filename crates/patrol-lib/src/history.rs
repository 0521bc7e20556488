//! Patrol run history
//!
//! Bounded ring of run records with debounced persistence. Save failures are
//! surfaced through a callback and never abort the caller.

use crate::models::PatrolRunRecord;
use crate::providers::HistoryPersistence;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Default cap on retained run records
const DEFAULT_MAX_RECORDS: usize = 200;

/// Default debounce before a mutation is flushed
const DEFAULT_SAVE_DEBOUNCE: Duration = Duration::from_secs(1);

/// Callback invoked when a history save fails
pub type HistorySaveErrorCallback = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

/// Bounded ring of patrol run records with debounced persistence
pub struct RunHistoryStore {
    records: Arc<RwLock<VecDeque<PatrolRunRecord>>>,
    persistence: Arc<RwLock<Option<Arc<dyn HistoryPersistence>>>>,
    save_pending: Arc<AtomicBool>,
    last_save: Arc<RwLock<Option<DateTime<Utc>>>>,
    on_save_error: Arc<RwLock<Option<HistorySaveErrorCallback>>>,
    max_records: usize,
    save_debounce: Duration,
}

impl RunHistoryStore {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_RECORDS, DEFAULT_SAVE_DEBOUNCE)
    }

    pub fn with_limits(max_records: usize, save_debounce: Duration) -> Self {
        Self {
            records: Arc::new(RwLock::new(VecDeque::new())),
            persistence: Arc::new(RwLock::new(None)),
            save_pending: Arc::new(AtomicBool::new(false)),
            last_save: Arc::new(RwLock::new(None)),
            on_save_error: Arc::new(RwLock::new(None)),
            max_records,
            save_debounce,
        }
    }

    /// Append a run record, evicting the oldest past the cap
    pub async fn record(&self, record: PatrolRunRecord) {
        {
            let mut records = self.records.write().await;
            records.push_back(record);
            while records.len() > self.max_records {
                records.pop_front();
            }
        }
        self.schedule_save();
    }

    /// Most recent records, newest first
    pub async fn recent(&self, limit: usize) -> Vec<PatrolRunRecord> {
        let records = self.records.read().await;
        records.iter().rev().take(limit).cloned().collect()
    }

    /// The newest record, if any
    pub async fn latest(&self) -> Option<PatrolRunRecord> {
        self.records.read().await.back().cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Wire a persistence port, loading previously saved records first
    pub async fn set_persistence(&self, port: Arc<dyn HistoryPersistence>) {
        match port.load_run_history().await {
            Ok(loaded) => {
                let mut records = self.records.write().await;
                records.extend(loaded);
                while records.len() > self.max_records {
                    records.pop_front();
                }
                info!(count = records.len(), "Loaded patrol run history");
            }
            Err(e) => warn!(error = %e, "Failed to load run history, starting fresh"),
        }
        *self.persistence.write().await = Some(port);
    }

    /// Register the callback invoked when a save fails
    pub async fn set_save_error_callback(&self, cb: HistorySaveErrorCallback) {
        *self.on_save_error.write().await = Some(cb);
    }

    /// Time of the last successful save; `None` until one succeeds
    pub async fn last_save_time(&self) -> Option<DateTime<Utc>> {
        *self.last_save.read().await
    }

    fn schedule_save(&self) {
        if self.save_pending.swap(true, Ordering::SeqCst) {
            return;
        }

        let records = Arc::clone(&self.records);
        let persistence = Arc::clone(&self.persistence);
        let save_pending = Arc::clone(&self.save_pending);
        let last_save = Arc::clone(&self.last_save);
        let on_error = Arc::clone(&self.on_save_error);
        let debounce = self.save_debounce;

        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            save_pending.store(false, Ordering::SeqCst);

            let port = match persistence.read().await.as_ref() {
                Some(p) => Arc::clone(p),
                None => return,
            };
            let snapshot: Vec<PatrolRunRecord> =
                records.read().await.iter().cloned().collect();

            match port.save_run_history(&snapshot).await {
                Ok(()) => *last_save.write().await = Some(Utc::now()),
                Err(e) => {
                    warn!(error = %e, "Failed to persist run history");
                    if let Some(cb) = on_error.read().await.as_ref() {
                        cb(&e);
                    }
                }
            }
        });
    }
}

impl Default for RunHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PatrolType, ResourcesChecked, RunStatus, TokenUsage};
    use crate::providers::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn test_record(id: &str) -> PatrolRunRecord {
        let now = Utc::now();
        PatrolRunRecord {
            id: id.to_string(),
            started_at: now,
            completed_at: now,
            duration_ms: 1200,
            patrol_type: PatrolType::Scheduled,
            checked: ResourcesChecked {
                nodes: 2,
                guests: 10,
                ..Default::default()
            },
            new_findings: 1,
            existing_findings: 0,
            resolved_findings: 0,
            rejected_findings: 0,
            auto_fixes: 0,
            findings_summary: "1 new finding".to_string(),
            finding_ids: vec!["abc".to_string()],
            status: RunStatus::IssuesFound,
            usage: TokenUsage::default(),
            model: "test-model".to_string(),
            error_count: 0,
        }
    }

    #[tokio::test]
    async fn test_ring_evicts_oldest() {
        let store = RunHistoryStore::with_limits(3, Duration::from_millis(10));
        for i in 0..5 {
            store.record(test_record(&format!("run-{i}"))).await;
        }

        assert_eq!(store.len().await, 3);
        let recent = store.recent(10).await;
        assert_eq!(recent[0].id, "run-4");
        assert_eq!(recent[2].id, "run-2");
    }

    #[tokio::test]
    async fn test_latest() {
        let store = RunHistoryStore::new();
        assert!(store.latest().await.is_none());
        store.record(test_record("run-1")).await;
        store.record(test_record("run-2")).await;
        assert_eq!(store.latest().await.unwrap().id, "run-2");
    }

    struct MemoryHistory {
        saved: RwLock<Vec<PatrolRunRecord>>,
        saves: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl HistoryPersistence for MemoryHistory {
        async fn save_run_history(&self, records: &[PatrolRunRecord]) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("io error");
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            *self.saved.write().await = records.to_vec();
            Ok(())
        }

        async fn load_run_history(&self) -> anyhow::Result<Vec<PatrolRunRecord>> {
            Ok(self.saved.read().await.clone())
        }
    }

    #[tokio::test]
    async fn test_debounced_save_and_reload() {
        let port = Arc::new(MemoryHistory {
            saved: RwLock::new(Vec::new()),
            saves: AtomicUsize::new(0),
            fail: false,
        });

        let store = RunHistoryStore::with_limits(10, Duration::from_millis(20));
        store.set_persistence(port.clone()).await;
        for i in 0..4 {
            store.record(test_record(&format!("run-{i}"))).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(port.saves.load(Ordering::SeqCst), 1);
        assert!(store.last_save_time().await.is_some());

        let reloaded = RunHistoryStore::new();
        reloaded.set_persistence(port).await;
        assert_eq!(reloaded.len().await, 4);
    }

    #[tokio::test]
    async fn test_save_error_callback_fires() {
        let port = Arc::new(MemoryHistory {
            saved: RwLock::new(Vec::new()),
            saves: AtomicUsize::new(0),
            fail: true,
        });

        let store = RunHistoryStore::with_limits(10, Duration::from_millis(10));
        store.set_persistence(port).await;

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        store
            .set_save_error_callback(Arc::new(move |_: &anyhow::Error| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        store.record(test_record("run-1")).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(store.last_save_time().await.is_none());
        assert_eq!(store.len().await, 1);
    }
}
