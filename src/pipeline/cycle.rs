//! One monitoring cycle for one target.
//!
//! Fetch, normalize, compare with the latest snapshot, store, and alert.
//! Every step runs in order; a failure ends the cycle for this target only
//! and is reflected in its [`TargetStatus`](crate::models::TargetStatus).

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, StorageError};
use crate::models::{ChangeRecord, CycleState, Snapshot, SnapshotId, Target};
use crate::pipeline::detect::ChangeDetector;
use crate::pipeline::dispatch::{AlertDispatcher, DispatchReport};
use crate::pipeline::guard::{ContentGuard, GuardResult};
use crate::pipeline::normalize::Normalizer;
use crate::pipeline::status::StatusBoard;
use crate::services::Fetcher;
use crate::storage::HistoryStore;

/// Global bound on simultaneously running cycles, with an in-flight gauge.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a free slot. `None` once the limiter is closed.
    pub async fn acquire(&self) -> Option<CyclePermit> {
        let permit = Arc::clone(&self.permits).acquire_owned().await.ok()?;
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        Some(CyclePermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest in-flight count observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// A held concurrency slot.
pub struct CyclePermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for CyclePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything a cycle needs, passed explicitly.
pub struct CycleContext {
    pub fetcher: Fetcher,
    pub store: Arc<dyn HistoryStore>,
    pub detector: ChangeDetector,
    pub guard: ContentGuard,
    pub dispatcher: AlertDispatcher,
    pub limiter: ConcurrencyLimiter,
    pub statuses: StatusBoard,
    pub store_timeout: Duration,
}

/// How a cycle ended.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// First snapshot stored for the target
    Baseline,
    /// Content hash unchanged; snapshot stored
    Unchanged,
    Changed {
        change: ChangeRecord,
        /// `None` when the change was below the alert threshold
        report: Option<DispatchReport>,
    },
    Failed(ErrorKind),
    /// Shutdown arrived before anything was stored
    Cancelled,
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Baseline => "baseline",
            CycleOutcome::Unchanged => "unchanged",
            CycleOutcome::Changed { .. } => "changed",
            CycleOutcome::Failed(_) => "failed",
            CycleOutcome::Cancelled => "cancelled",
        }
    }
}

/// Run one cycle for a target.
pub async fn run_cycle(
    ctx: &CycleContext,
    target: &Target,
    cancel: &CancellationToken,
) -> CycleOutcome {
    // A store failure may have come after the write itself
    let status = ctx.statuses.get(&target.id);
    if status.consecutive_failures > 0
        && status
            .last_error
            .as_ref()
            .is_some_and(|e| e.kind == ErrorKind::Storage)
    {
        let resumed = ctx.dispatcher.resume_target(target).await;
        if resumed > 0 {
            log::info!("[{}] Resumed {} alert(s) after storage failure", target.id, resumed);
        }
    }

    let permit = tokio::select! {
        _ = cancel.cancelled() => return CycleOutcome::Cancelled,
        permit = ctx.limiter.acquire() => match permit {
            Some(permit) => permit,
            None => return CycleOutcome::Cancelled,
        },
    };

    // Fetching
    set_state(ctx, target, CycleState::Fetching);
    log::info!("[{}] Fetching {}", target.id, target.url);
    let fetched = tokio::select! {
        _ = cancel.cancelled() => {
            log::info!("[{}] Cancelled during fetch", target.id);
            set_state(ctx, target, CycleState::Idle);
            return CycleOutcome::Cancelled;
        }
        result = ctx.fetcher.fetch(target) => result,
    };
    let raw = match fetched {
        Ok(raw) => raw,
        Err(e) => {
            log::warn!("[{}] {}", target.id, e);
            drop(permit);
            return fail(ctx, target, e.kind()).await;
        }
    };

    // Detecting
    set_state(ctx, target, CycleState::Detecting);
    let form = match Normalizer::new(&target.extraction) {
        Ok(normalizer) => normalizer.normalize(&raw.body),
        Err(e) => {
            log::error!("[{}] Extraction rules rejected: {}", target.id, e);
            drop(permit);
            return fail(ctx, target, ErrorKind::Normalization).await;
        }
    };
    {
        let missing = form.missing_fields();
        if !missing.is_empty() {
            log::warn!("[{}] Fields not found: {}", target.id, missing.join(", "));
        }
    }

    let previous = match bounded(ctx.store_timeout, ctx.store.latest(&target.id)).await {
        Ok(previous) => previous,
        Err(e) => {
            log::error!("[{}] Failed to read history: {}", target.id, e);
            drop(permit);
            return fail(ctx, target, ErrorKind::Storage).await;
        }
    };

    let prior_trips = ctx.statuses.get(&target.id).guard_trips;
    match ctx.guard.check(
        form.line_count(),
        previous.as_ref().map(|p| p.canonical_content.lines().count()),
        prior_trips,
    ) {
        GuardResult::Tripped {
            current_lines,
            previous_lines,
            drop_percent,
        } => {
            log::warn!(
                "[{}] Content collapsed ({} -> {} lines, -{:.0}%); not stored",
                target.id,
                previous_lines,
                current_lines,
                drop_percent
            );
            drop(permit);
            ctx.statuses.update(&target.id, |s| s.guard_trips += 1);
            return fail(ctx, target, ErrorKind::TransientFetch).await;
        }
        GuardResult::Accepted { current_lines, .. } => {
            log::warn!(
                "[{}] Collapsed content persisted; accepting {} lines",
                target.id,
                current_lines
            );
        }
        GuardResult::Safe { .. } | GuardResult::ColdStart { .. } => {}
    }

    let id = match &previous {
        Some(prev) => prev.id.next(),
        None => SnapshotId::new(target.id.clone(), 1),
    };
    let fetched_at = next_timestamp(previous.as_ref().map(|p| p.fetched_at));
    let snapshot = Snapshot::from_canonical(id, fetched_at, form);
    let change = ctx
        .detector
        .detect(previous.as_ref(), &snapshot, &target.extraction);

    let short_hash = snapshot.short_hash().to_string();
    let snapshot_id = snapshot.id.clone();
    if let Err(e) = bounded(ctx.store_timeout, ctx.store.append(snapshot, change.clone())).await {
        log::error!("[{}] Failed to store {}: {}", target.id, snapshot_id, e);
        drop(permit);
        return fail(ctx, target, ErrorKind::Storage).await;
    }
    drop(permit);

    let outcome = match change {
        None if previous.is_none() => {
            log::info!("[{}] Baseline {} stored ({})", target.id, snapshot_id, short_hash);
            CycleOutcome::Baseline
        }
        None => {
            log::info!("[{}] No change ({})", target.id, short_hash);
            CycleOutcome::Unchanged
        }
        Some(change) => {
            log::info!(
                "[{}] Change {} detected: {} ({})",
                target.id,
                change.id,
                change.significance,
                change.diff_summary.describe()
            );

            let report = if target.should_alert(change.significance) {
                set_state(ctx, target, CycleState::Alerting);
                Some(ctx.dispatcher.dispatch(&change, target).await)
            } else {
                log::debug!(
                    "[{}] Below threshold {}; no alert",
                    target.id,
                    target.significance_threshold
                );
                None
            };
            CycleOutcome::Changed { change, report }
        }
    };

    let delivery_failed = matches!(
        &outcome,
        CycleOutcome::Changed { report: Some(report), .. } if !report.all_delivered()
    );
    ctx.statuses
        .update_and_persist(&target.id, |s| {
            s.record_success(Utc::now());
            if delivery_failed {
                s.record_delivery_failure(Utc::now());
            }
        })
        .await;

    outcome
}

fn set_state(ctx: &CycleContext, target: &Target, state: CycleState) {
    ctx.statuses.update(&target.id, |s| s.state = state);
}

async fn fail(ctx: &CycleContext, target: &Target, kind: ErrorKind) -> CycleOutcome {
    log::warn!("[{}] Cycle failed: {}", target.id, kind.reason());
    ctx.statuses
        .update_and_persist(&target.id, |s| {
            s.state = CycleState::Failed;
            s.record_failure(kind, Utc::now());
        })
        .await;
    ctx.statuses.update(&target.id, |s| s.state = CycleState::Idle);
    CycleOutcome::Failed(kind)
}

/// Bound a store operation by the configured timeout.
async fn bounded<T>(
    limit: Duration,
    operation: impl Future<Output = Result<T, StorageError>>,
) -> Result<T, StorageError> {
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| StorageError::Timeout(limit.as_secs()))?
}

/// Current time, nudged forward so it stays strictly after `previous`.
fn next_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if now <= prev => prev + chrono::Duration::milliseconds(1),
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AlertEvent, ChangeId, FieldRule, RenderMode, TargetStatus, fixtures,
    };
    use crate::services::ChannelRegistry;
    use crate::services::RenderPool;
    use crate::services::channels::testing::RecordingChannel;
    use crate::services::render::testing::ScriptedRenderer;
    use crate::storage::{LocalHistoryStore, SnapshotStream, StoreResult};
    use crate::utils::retry::RetryPolicy;
    use async_trait::async_trait;
    use axum::Router;
    use axum::extract::State;
    use axum::response::Html;
    use axum::routing::get;
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    /// Local store whose next append is written but reported as timed out.
    struct SlowAppendStore {
        inner: LocalHistoryStore,
        fail_next_append: AtomicBool,
    }

    #[async_trait]
    impl HistoryStore for SlowAppendStore {
        async fn latest(&self, target_id: &str) -> StoreResult<Option<Snapshot>> {
            self.inner.latest(target_id).await
        }

        async fn append(
            &self,
            snapshot: Snapshot,
            change: Option<ChangeRecord>,
        ) -> StoreResult<SnapshotId> {
            let id = self.inner.append(snapshot, change).await?;
            if self.fail_next_append.swap(false, Ordering::SeqCst) {
                return Err(StorageError::Timeout(1));
            }
            Ok(id)
        }

        async fn range(
            &self,
            target_id: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> StoreResult<SnapshotStream> {
            self.inner.range(target_id, from, to).await
        }

        async fn changes(
            &self,
            target_id: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> StoreResult<Vec<ChangeRecord>> {
            self.inner.changes(target_id, from, to).await
        }

        async fn change(&self, id: &ChangeId) -> StoreResult<Option<ChangeRecord>> {
            self.inner.change(id).await
        }

        async fn record_alert(&self, event: &AlertEvent) -> StoreResult<()> {
            self.inner.record_alert(event).await
        }

        async fn alerts(&self, target_id: &str) -> StoreResult<Vec<AlertEvent>> {
            self.inner.alerts(target_id).await
        }

        async fn save_status(&self, statuses: &BTreeMap<String, TargetStatus>) -> StoreResult<()> {
            self.inner.save_status(statuses).await
        }

        async fn load_status(&self) -> StoreResult<BTreeMap<String, TargetStatus>> {
            self.inner.load_status().await
        }
    }

    fn context(
        store: Arc<dyn HistoryStore>,
        channel: Arc<RecordingChannel>,
        render: Option<RenderPool>,
    ) -> CycleContext {
        let mut channels = ChannelRegistry::default();
        channels.insert(channel);
        CycleContext {
            fetcher: Fetcher::new(reqwest::Client::new(), RetryPolicy::immediate(1), render),
            store: Arc::clone(&store),
            detector: ChangeDetector::default(),
            guard: ContentGuard::default(),
            dispatcher: AlertDispatcher::new(
                channels,
                Arc::clone(&store),
                RetryPolicy::immediate(1),
                Duration::from_secs(1),
                None,
            ),
            limiter: ConcurrencyLimiter::new(1),
            statuses: StatusBoard::new(store, BTreeMap::new()),
            store_timeout: Duration::from_secs(5),
        }
    }

    async fn serve(body: Arc<Mutex<String>>) -> SocketAddr {
        let app = Router::new()
            .route(
                "/form",
                get(|State(body): State<Arc<Mutex<String>>>| async move {
                    Html(body.lock().unwrap().clone())
                }),
            )
            .with_state(body);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn page(revision: &str) -> String {
        format!("<html><body><h1>WH-347</h1><p id=\"rev\">Rev. {revision}</p></body></html>")
    }

    #[tokio::test]
    async fn test_change_committed_despite_store_error_is_still_alerted() {
        let temp = TempDir::new().unwrap();
        let slow = Arc::new(SlowAppendStore {
            inner: LocalHistoryStore::new(temp.path()),
            fail_next_append: AtomicBool::new(false),
        });
        let store: Arc<dyn HistoryStore> = slow.clone();
        let channel = Arc::new(RecordingChannel::new("log"));
        let ctx = context(Arc::clone(&store), Arc::clone(&channel), None);

        let body = Arc::new(Mutex::new(page("01/2024")));
        let addr = serve(Arc::clone(&body)).await;
        let mut target = fixtures::target("wh347");
        target.url = format!("http://{addr}/form");
        target.extraction.fields.push(FieldRule {
            name: "revision".into(),
            selector: "#rev".into(),
            attr: None,
            pattern: None,
            tracked: true,
        });
        let cancel = CancellationToken::new();

        assert!(matches!(
            run_cycle(&ctx, &target, &cancel).await,
            CycleOutcome::Baseline
        ));

        *body.lock().unwrap() = page("07/2024");
        slow.fail_next_append.store(true, Ordering::SeqCst);
        assert!(matches!(
            run_cycle(&ctx, &target, &cancel).await,
            CycleOutcome::Failed(ErrorKind::Storage)
        ));
        assert_eq!(channel.delivered_count(), 0);
        assert_eq!(
            store
                .changes("wh347", DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)
                .await
                .unwrap()
                .len(),
            1
        );

        // Same content again: no new change, but the stored one is alerted
        assert!(matches!(
            run_cycle(&ctx, &target, &cancel).await,
            CycleOutcome::Unchanged
        ));
        assert_eq!(channel.delivered_count(), 1);
        assert_eq!(ctx.statuses.get("wh347").consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_cancel_during_render_releases_session() {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn HistoryStore> = Arc::new(LocalHistoryStore::new(temp.path()));
        let renderer = Arc::new(ScriptedRenderer::stalling());
        let pool = RenderPool::new(renderer.clone(), 1, Duration::from_secs(30));
        let channel = Arc::new(RecordingChannel::new("log"));
        let ctx = Arc::new(context(Arc::clone(&store), channel, Some(pool.clone())));

        let mut target = fixtures::target("ca-dir");
        target.render_mode = RenderMode::Dynamic;
        let cancel = CancellationToken::new();

        let cycle = {
            let ctx = Arc::clone(&ctx);
            let cancel = cancel.clone();
            tokio::spawn(async move { run_cycle(&ctx, &target, &cancel).await })
        };

        tokio::time::timeout(Duration::from_secs(2), async {
            while renderer.navigated.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(pool.available(), 0);

        cancel.cancel();
        let outcome = cycle.await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Cancelled));

        tokio::time::timeout(Duration::from_secs(2), async {
            while pool.available() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(renderer.closed.load(Ordering::SeqCst), 1);
        assert!(store.latest("ca-dir").await.unwrap().is_none());
        assert_eq!(ctx.limiter.in_flight(), 0);
    }

    #[test]
    fn test_next_timestamp_is_strictly_later() {
        let future = Utc::now() + chrono::Duration::hours(1);
        let next = next_timestamp(Some(future));
        assert!(next > future);

        let past = Utc::now() - chrono::Duration::hours(1);
        assert!(next_timestamp(Some(past)) > past);
    }

    #[tokio::test]
    async fn test_limiter_tracks_peak() {
        let limiter = ConcurrencyLimiter::new(2);
        let a = limiter.acquire().await.unwrap();
        let b = limiter.acquire().await.unwrap();
        assert_eq!(limiter.in_flight(), 2);

        let blocked =
            tokio::time::timeout(Duration::from_millis(20), limiter.acquire()).await;
        assert!(blocked.is_err());

        drop(a);
        drop(b);
        assert_eq!(limiter.in_flight(), 0);
        assert_eq!(limiter.peak(), 2);
    }
}
