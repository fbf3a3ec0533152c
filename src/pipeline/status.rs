//! Shared operator-visible status for all targets.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::models::TargetStatus;
use crate::storage::{HistoryStore, StoreResult};

/// Per-target status map shared by all cycles.
///
/// Updates are applied in memory and then persisted as a whole, so a
/// restarted monitor shows the state the last run left behind.
#[derive(Clone)]
pub struct StatusBoard {
    statuses: Arc<Mutex<BTreeMap<String, TargetStatus>>>,
    /// Held from copying the map until its write completes
    persist_lock: Arc<tokio::sync::Mutex<()>>,
    store: Arc<dyn HistoryStore>,
}

impl StatusBoard {
    pub fn new(store: Arc<dyn HistoryStore>, initial: BTreeMap<String, TargetStatus>) -> Self {
        Self {
            statuses: Arc::new(Mutex::new(initial)),
            persist_lock: Arc::new(tokio::sync::Mutex::new(())),
            store,
        }
    }

    /// Restore the last persisted map.
    pub async fn load(store: Arc<dyn HistoryStore>) -> StoreResult<Self> {
        let initial = store.load_status().await?;
        Ok(Self::new(store, initial))
    }

    /// Apply an update to one target's status in memory.
    pub fn update<F>(&self, target_id: &str, update: F) -> TargetStatus
    where
        F: FnOnce(&mut TargetStatus),
    {
        let mut statuses = self.statuses.lock().unwrap_or_else(PoisonError::into_inner);
        let status = statuses.entry(target_id.to_string()).or_default();
        update(status);
        status.clone()
    }

    /// Apply an update and persist the whole map.
    ///
    /// A failed write is logged; the in-memory status stays current.
    pub async fn update_and_persist<F>(&self, target_id: &str, update: F) -> TargetStatus
    where
        F: FnOnce(&mut TargetStatus),
    {
        let status = self.update(target_id, update);
        if let Err(e) = self.persist().await {
            log::warn!("[{}] Failed to persist status: {}", target_id, e);
        }
        status
    }

    /// Write the current map. Concurrent calls are serialized, so the last
    /// write always carries the newest map.
    pub async fn persist(&self) -> StoreResult<()> {
        let _writing = self.persist_lock.lock().await;
        let snapshot = self.snapshot();
        self.store.save_status(&snapshot).await
    }

    pub fn get(&self, target_id: &str) -> TargetStatus {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, TargetStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::CycleState;
    use crate::storage::LocalHistoryStore;
    use chrono::Utc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_status_survives_reload() {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn HistoryStore> = Arc::new(LocalHistoryStore::new(temp.path()));

        let board = StatusBoard::load(Arc::clone(&store)).await.unwrap();
        board
            .update_and_persist("wh347", |s| {
                s.state = CycleState::Failed;
                s.record_failure(ErrorKind::PermanentFetch, Utc::now());
            })
            .await;
        board.update("ca-dir", |s| s.skipped_triggers += 1);

        let reloaded = StatusBoard::load(store).await.unwrap();
        let status = reloaded.get("wh347");
        assert_eq!(status.state, CycleState::Failed);
        assert!(status.needs_attention);
        // Not persisted yet
        assert_eq!(reloaded.get("ca-dir").skipped_triggers, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_persists_end_with_newest_map() {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn HistoryStore> = Arc::new(LocalHistoryStore::new(temp.path()));
        let board = StatusBoard::new(Arc::clone(&store), BTreeMap::new());

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let board = board.clone();
                tokio::spawn(async move {
                    board
                        .update_and_persist(&format!("form-{}", i % 4), |s| s.skipped_triggers += 1)
                        .await;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let saved = store.load_status().await.unwrap();
        assert_eq!(saved, board.snapshot());
        let total: u64 = saved.values().map(|s| s.skipped_triggers).sum();
        assert_eq!(total, 32);
    }
}
