//! Storage abstractions for observation history.
//!
//! The history store is the only owner of snapshots, change records, and
//! alert events. Snapshots and change records are append-only; alert events
//! are persisted as a sequence of transitions whose newest entry wins.
//!
//! ## Directory Structure
//!
//! ```text
//! storage/
//! ├── status.json                 # Operator-visible TargetStatus map
//! └── history/
//!     └── {target_id}/
//!         ├── log.jsonl           # One HistoryEntry per line
//!         └── alerts.jsonl        # AlertEvent transitions
//! ```

pub mod local;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::models::{AlertEvent, ChangeId, ChangeRecord, Snapshot, SnapshotId, TargetStatus};

// Re-export for convenience
pub use local::LocalHistoryStore;

/// Result type for history store operations.
pub type StoreResult<T> = std::result::Result<T, StorageError>;

/// Lazy, ordered stream of snapshots.
pub type SnapshotStream = BoxStream<'static, StoreResult<Snapshot>>;

/// One line of a target's history log.
///
/// A snapshot and the change record leading to it are committed together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub snapshot: Snapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<ChangeRecord>,
}

/// Trait for history storage backends.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Most recent snapshot of a target.
    async fn latest(&self, target_id: &str) -> StoreResult<Option<Snapshot>>;

    /// Append a snapshot, with the change record leading to it if any.
    ///
    /// The snapshot must directly follow the latest one: `seq` one higher
    /// and `fetched_at` strictly later. Otherwise nothing is written and
    /// [`StorageError::OutOfOrder`] is returned.
    async fn append(
        &self,
        snapshot: Snapshot,
        change: Option<ChangeRecord>,
    ) -> StoreResult<SnapshotId>;

    /// Snapshots with `from <= fetched_at < to`, oldest first.
    ///
    /// Every call reads the history afresh.
    async fn range(
        &self,
        target_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<SnapshotStream>;

    /// Change records with `from <= detected_at < to`, oldest first.
    async fn changes(
        &self,
        target_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<ChangeRecord>>;

    /// Look up a single change record.
    async fn change(&self, id: &ChangeId) -> StoreResult<Option<ChangeRecord>>;

    /// Persist an alert event transition.
    async fn record_alert(&self, event: &AlertEvent) -> StoreResult<()>;

    /// Current state of every alert event of a target.
    async fn alerts(&self, target_id: &str) -> StoreResult<Vec<AlertEvent>>;

    /// Persist the operator-visible status map.
    async fn save_status(&self, statuses: &BTreeMap<String, TargetStatus>) -> StoreResult<()>;

    /// Load the status map, empty if none was saved yet.
    async fn load_status(&self) -> StoreResult<BTreeMap<String, TargetStatus>>;
}
