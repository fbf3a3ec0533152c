//! Local filesystem history store.
//!
//! ## Storage Layout
//!
//! ```text
//! {root}/
//! ├── status.json           # TargetStatus map (atomic temp + rename)
//! └── history/
//!     └── {target_id}/
//!         ├── log.jsonl     # HistoryEntry per line, append-only
//!         └── alerts.jsonl  # AlertEvent transitions, append-only
//! ```
//!
//! ## Durability
//!
//! Every append writes one complete line and syncs it before returning. A
//! crash mid-write can only leave a torn trailing line; readers ignore it
//! and the next writer truncates it before appending.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use serde::{Serialize, de::DeserializeOwned};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::StorageError;
use crate::models::{AlertEvent, ChangeId, ChangeRecord, Snapshot, SnapshotId, TargetStatus};
use crate::storage::{HistoryEntry, HistoryStore, SnapshotStream, StoreResult};

const STATUS_FILE: &str = "status.json";
const LOG_FILE: &str = "log.jsonl";
const ALERTS_FILE: &str = "alerts.jsonl";

/// In-memory view of one target's history, guarded by its own lock.
#[derive(Debug, Default)]
struct TargetLog {
    /// `latest` matches what is on disk
    loaded: bool,
    latest: Option<Snapshot>,
    /// The alerts file ends with a complete line
    alerts_clean: bool,
}

/// Local filesystem history store.
pub struct LocalHistoryStore {
    root_dir: PathBuf,
    targets: Mutex<HashMap<String, Arc<AsyncMutex<TargetLog>>>>,
    status_lock: AsyncMutex<()>,
}

impl LocalHistoryStore {
    /// Create a new store rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            targets: Mutex::new(HashMap::new()),
            status_lock: AsyncMutex::new(()),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn target_dir(&self, target_id: &str) -> PathBuf {
        self.root_dir.join("history").join(target_id)
    }

    fn log_path(&self, target_id: &str) -> PathBuf {
        self.target_dir(target_id).join(LOG_FILE)
    }

    fn alerts_path(&self, target_id: &str) -> PathBuf {
        self.target_dir(target_id).join(ALERTS_FILE)
    }

    /// Lock handle serializing writes for one target.
    fn target_log(&self, target_id: &str) -> Arc<AsyncMutex<TargetLog>> {
        let mut targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(targets.entry(target_id.to_string()).or_default())
    }

    /// Load the latest snapshot from disk, repairing a torn trailing line.
    async fn ensure_loaded(&self, target_id: &str, state: &mut TargetLog) -> StoreResult<()> {
        if state.loaded {
            return Ok(());
        }

        let lines = read_complete_lines(&self.log_path(target_id), true).await?;
        state.latest = match lines.last() {
            Some(line) => Some(serde_json::from_str::<HistoryEntry>(line)?.snapshot),
            None => None,
        };
        state.loaded = true;
        Ok(())
    }

    async fn read_entries(&self, target_id: &str) -> StoreResult<Vec<HistoryEntry>> {
        read_complete_lines(&self.log_path(target_id), false)
            .await?
            .iter()
            .map(|line| -> StoreResult<HistoryEntry> { Ok(serde_json::from_str(line)?) })
            .collect()
    }

    /// Write bytes atomically (write to temp, then rename).
    async fn write_bytes(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        let path = self.root_dir.join(key);
        ensure_parent(&path).await?;

        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_data().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_bytes(key, &bytes).await
    }

    /// Read JSON data, returning None if the file doesn't exist.
    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match tokio::fs::read(self.root_dir.join(key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl HistoryStore for LocalHistoryStore {
    async fn latest(&self, target_id: &str) -> StoreResult<Option<Snapshot>> {
        let log = self.target_log(target_id);
        let mut state = log.lock().await;
        self.ensure_loaded(target_id, &mut state).await?;
        Ok(state.latest.clone())
    }

    async fn append(
        &self,
        snapshot: Snapshot,
        change: Option<ChangeRecord>,
    ) -> StoreResult<SnapshotId> {
        let target_id = snapshot.id.target_id.clone();
        let log = self.target_log(&target_id);
        let mut state = log.lock().await;
        self.ensure_loaded(&target_id, &mut state).await?;

        let (expected_seq, latest_fetched_at) = match &state.latest {
            Some(latest) => (latest.id.seq + 1, Some(latest.fetched_at)),
            None => (1, None),
        };
        let in_order = snapshot.id.seq == expected_seq
            && latest_fetched_at.is_none_or(|at| snapshot.fetched_at > at);
        if !in_order {
            return Err(StorageError::OutOfOrder {
                target_id,
                expected_seq,
                seq: snapshot.id.seq,
                latest_fetched_at: latest_fetched_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string()),
            });
        }

        if let Some(change) = &change {
            let previous = state.latest.as_ref().map(|s| &s.id);
            if change.to_snapshot != snapshot.id || previous != Some(&change.from_snapshot) {
                return Err(StorageError::Inconsistent(format!(
                    "change {} does not lead from the latest snapshot to {}",
                    change.id, snapshot.id
                )));
            }
        }

        let entry = HistoryEntry { snapshot, change };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        // An interrupted write leaves a torn line behind; reload before the next append
        state.loaded = false;
        append_line(&self.log_path(&target_id), &line).await?;

        let id = entry.snapshot.id.clone();
        log::debug!("[{}] Stored snapshot {}", target_id, id);
        state.latest = Some(entry.snapshot);
        state.loaded = true;
        Ok(id)
    }

    async fn range(
        &self,
        target_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<SnapshotStream> {
        let file = match File::open(self.log_path(target_id)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(stream::empty().boxed());
            }
            Err(e) => return Err(e.into()),
        };

        let snapshots = stream::unfold(Some(BufReader::new(file)), move |reader| async move {
            let mut reader = reader?;
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    // End of file, or a torn trailing line
                    Ok(0) => return None,
                    Ok(_) if !line.ends_with('\n') => return None,
                    Ok(_) if line.trim().is_empty() => continue,
                    Ok(_) => match serde_json::from_str::<HistoryEntry>(&line) {
                        Ok(entry) if entry.snapshot.fetched_at < from => continue,
                        Ok(entry) if entry.snapshot.fetched_at >= to => return None,
                        Ok(entry) => return Some((Ok(entry.snapshot), Some(reader))),
                        Err(e) => return Some((Err(StorageError::from(e)), None)),
                    },
                    Err(e) => return Some((Err(StorageError::from(e)), None)),
                }
            }
        });

        Ok(snapshots.boxed())
    }

    async fn changes(
        &self,
        target_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<ChangeRecord>> {
        Ok(self
            .read_entries(target_id)
            .await?
            .into_iter()
            .filter_map(|entry| entry.change)
            .filter(|change| change.detected_at >= from && change.detected_at < to)
            .collect())
    }

    async fn change(&self, id: &ChangeId) -> StoreResult<Option<ChangeRecord>> {
        Ok(self
            .read_entries(&id.target_id)
            .await?
            .into_iter()
            .filter(|entry| entry.snapshot.id.seq == id.seq)
            .find_map(|entry| entry.change))
    }

    async fn record_alert(&self, event: &AlertEvent) -> StoreResult<()> {
        let target_id = &event.change_id.target_id;
        let path = self.alerts_path(target_id);
        let log = self.target_log(target_id);
        let mut state = log.lock().await;

        if !state.alerts_clean {
            read_complete_lines(&path, true).await?;
        }

        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        state.alerts_clean = false;
        append_line(&path, &line).await?;
        state.alerts_clean = true;
        Ok(())
    }

    async fn alerts(&self, target_id: &str) -> StoreResult<Vec<AlertEvent>> {
        let mut current: BTreeMap<(ChangeId, String), AlertEvent> = BTreeMap::new();
        for line in read_complete_lines(&self.alerts_path(target_id), false).await? {
            let event: AlertEvent = serde_json::from_str(&line)?;
            current.insert(event.key(), event);
        }
        Ok(current.into_values().collect())
    }

    async fn save_status(&self, statuses: &BTreeMap<String, TargetStatus>) -> StoreResult<()> {
        let _guard = self.status_lock.lock().await;
        self.write_json(STATUS_FILE, statuses).await
    }

    async fn load_status(&self) -> StoreResult<BTreeMap<String, TargetStatus>> {
        Ok(self.read_json(STATUS_FILE).await?.unwrap_or_default())
    }
}

async fn ensure_parent(path: &Path) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Append one complete line and sync it to disk.
async fn append_line(path: &Path, line: &str) -> StoreResult<()> {
    ensure_parent(path).await?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}

/// Read all newline-terminated lines of a JSONL file.
///
/// A trailing fragment without a newline is skipped, and cut off the file
/// when `repair` is set. Callers repairing must hold the target's lock.
async fn read_complete_lines(path: &Path, repair: bool) -> StoreResult<Vec<String>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let complete = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |i| i + 1);

    if complete < bytes.len() {
        log::warn!(
            "Ignoring torn trailing line ({} bytes) in {}",
            bytes.len() - complete,
            path.display()
        );
        if repair {
            let file = OpenOptions::new().write(true).open(path).await?;
            file.set_len(complete as u64).await?;
            file.sync_data().await?;
        }
    }

    Ok(String::from_utf8_lossy(&bytes[..complete])
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertStatus, DiffSummary, Significance};
    use crate::utils::content_hash;
    use chrono::{Duration, TimeZone};
    use futures::TryStreamExt;
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn snapshot(target: &str, seq: u64, fetched_at: DateTime<Utc>, content: &str) -> Snapshot {
        Snapshot {
            id: SnapshotId::new(target, seq),
            fetched_at,
            canonical_content: content.to_string(),
            content_hash: content_hash(content),
            extracted_fields: BTreeMap::new(),
        }
    }

    fn change_between(from: &Snapshot, to: &Snapshot) -> ChangeRecord {
        ChangeRecord {
            id: ChangeId::for_snapshot(&to.id),
            from_snapshot: from.id.clone(),
            to_snapshot: to.id.clone(),
            diff_summary: DiffSummary::default(),
            significance: Significance::Major,
            detected_at: to.fetched_at,
        }
    }

    #[tokio::test]
    async fn test_append_and_latest() {
        let tmp = TempDir::new().unwrap();
        let store = LocalHistoryStore::new(tmp.path());

        assert!(store.latest("wh347").await.unwrap().is_none());

        let first = snapshot("wh347", 1, at(0), "A");
        let id = store.append(first.clone(), None).await.unwrap();
        assert_eq!(id, first.id);
        assert_eq!(store.latest("wh347").await.unwrap(), Some(first.clone()));

        // A fresh instance reads the same state from disk
        let reopened = LocalHistoryStore::new(tmp.path());
        assert_eq!(reopened.latest("wh347").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_out_of_order_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = LocalHistoryStore::new(tmp.path());

        store
            .append(snapshot("wh347", 1, at(10), "A"), None)
            .await
            .unwrap();

        let skipped = store.append(snapshot("wh347", 3, at(20), "B"), None).await;
        assert!(matches!(
            skipped,
            Err(StorageError::OutOfOrder {
                expected_seq: 2,
                seq: 3,
                ..
            })
        ));

        let stale = store.append(snapshot("wh347", 2, at(10), "B"), None).await;
        assert!(matches!(stale, Err(StorageError::OutOfOrder { .. })));

        let first_seq = store.append(snapshot("other", 2, at(0), "X"), None).await;
        assert!(matches!(
            first_seq,
            Err(StorageError::OutOfOrder {
                expected_seq: 1,
                ..
            })
        ));

        assert_eq!(store.latest("wh347").await.unwrap().unwrap().id.seq, 1);
    }

    #[tokio::test]
    async fn test_change_must_follow_latest() {
        let tmp = TempDir::new().unwrap();
        let store = LocalHistoryStore::new(tmp.path());

        let a = snapshot("wh347", 1, at(0), "A");
        let b = snapshot("wh347", 2, at(1), "B");
        store.append(a.clone(), None).await.unwrap();

        let mut wrong = change_between(&a, &b);
        wrong.from_snapshot = SnapshotId::new("wh347", 7);
        let result = store.append(b.clone(), Some(wrong)).await;
        assert!(matches!(result, Err(StorageError::Inconsistent(_))));

        let change = change_between(&a, &b);
        store.append(b.clone(), Some(change.clone())).await.unwrap();
        assert_eq!(store.change(&change.id).await.unwrap(), Some(change));
    }

    #[tokio::test]
    async fn test_torn_trailing_line_ignored_and_repaired() {
        let tmp = TempDir::new().unwrap();
        let store = LocalHistoryStore::new(tmp.path());
        let a = snapshot("wh347", 1, at(0), "A");
        store.append(a.clone(), None).await.unwrap();

        let path = store.log_path("wh347");
        let mut file = OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(br#"{"snapshot":{"id":{"target_id":"wh3"#)
            .await
            .unwrap();
        file.flush().await.unwrap();
        drop(file);

        let reopened = LocalHistoryStore::new(tmp.path());
        let all: Vec<Snapshot> = reopened
            .range("wh347", at(-100), at(100))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all, vec![a.clone()]);
        assert_eq!(reopened.latest("wh347").await.unwrap(), Some(a));

        reopened
            .append(snapshot("wh347", 2, at(1), "B"), None)
            .await
            .unwrap();
        let entries = reopened.read_entries("wh347").await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_range_is_half_open_and_restartable() {
        let tmp = TempDir::new().unwrap();
        let store = LocalHistoryStore::new(tmp.path());
        for seq in 1..=5u64 {
            let snap = snapshot("wh347", seq, at(seq as i64 * 10), &format!("v{seq}"));
            store.append(snap, None).await.unwrap();
        }

        let seqs = |snaps: Vec<Snapshot>| snaps.iter().map(|s| s.id.seq).collect::<Vec<_>>();

        let first: Vec<Snapshot> = store
            .range("wh347", at(20), at(40))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(seqs(first), vec![2, 3]);

        let again: Vec<Snapshot> = store
            .range("wh347", at(20), at(40))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(seqs(again), vec![2, 3]);

        let missing: Vec<Snapshot> = store
            .range("nobody", at(0), at(100))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_changes_by_time() {
        let tmp = TempDir::new().unwrap();
        let store = LocalHistoryStore::new(tmp.path());
        let a = snapshot("wh347", 1, at(0), "A");
        let b = snapshot("wh347", 2, at(10), "B");
        let c = snapshot("wh347", 3, at(20), "C");
        store.append(a.clone(), None).await.unwrap();
        store
            .append(b.clone(), Some(change_between(&a, &b)))
            .await
            .unwrap();
        store
            .append(c.clone(), Some(change_between(&b, &c)))
            .await
            .unwrap();

        let all = store.changes("wh347", at(0), at(100)).await.unwrap();
        assert_eq!(all.len(), 2);

        let later = store.changes("wh347", at(15), at(100)).await.unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].to_snapshot, c.id);
    }

    #[tokio::test]
    async fn test_alerts_latest_state_wins() {
        let tmp = TempDir::new().unwrap();
        let store = LocalHistoryStore::new(tmp.path());
        let change_id = ChangeId {
            target_id: "wh347".into(),
            seq: 2,
        };

        let mut slack = AlertEvent::pending(change_id.clone(), "slack");
        store.record_alert(&slack).await.unwrap();
        slack.begin_attempt(at(1));
        slack.mark_delivered();
        store.record_alert(&slack).await.unwrap();

        let webhook = AlertEvent::pending(change_id, "webhook");
        store.record_alert(&webhook).await.unwrap();

        let events = store.alerts("wh347").await.unwrap();
        assert_eq!(events.len(), 2);
        let slack = events.iter().find(|e| e.channel == "slack").unwrap();
        assert_eq!(slack.status, AlertStatus::Delivered);
        assert_eq!(slack.attempts, 1);
        let webhook = events.iter().find(|e| e.channel == "webhook").unwrap();
        assert_eq!(webhook.status, AlertStatus::Pending);
    }

    #[tokio::test]
    async fn test_status_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = LocalHistoryStore::new(tmp.path());
        assert!(store.load_status().await.unwrap().is_empty());

        let mut status = TargetStatus::default();
        status.record_success(at(0));
        let statuses = BTreeMap::from([("wh347".to_string(), status)]);
        store.save_status(&statuses).await.unwrap();

        assert_eq!(store.load_status().await.unwrap(), statuses);
        assert!(!tmp.path().join("status.tmp").exists());
    }

    #[tokio::test]
    async fn test_concurrent_appends_stay_ordered() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LocalHistoryStore::new(tmp.path()));

        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut stored = 0;
                while stored < 5 {
                    let latest = store.latest("wh347").await.unwrap();
                    let (seq, fetched_at) = match &latest {
                        Some(s) => (s.id.seq + 1, s.fetched_at + Duration::milliseconds(1)),
                        None => (1, at(0)),
                    };
                    let snap = snapshot("wh347", seq, fetched_at, &format!("{worker}-{seq}"));
                    match store.append(snap, None).await {
                        Ok(_) => stored += 1,
                        Err(StorageError::OutOfOrder { .. }) => continue,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let all: Vec<Snapshot> = store
            .range("wh347", at(-1), at(3600))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all.len(), 40);
        for pair in all.windows(2) {
            assert_eq!(pair[1].id.seq, pair[0].id.seq + 1);
            assert!(pair[1].fetched_at > pair[0].fetched_at);
        }
    }
}
