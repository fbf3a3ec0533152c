//! Monitor orchestration.
//!
//! [`Monitor`] owns the target registry and the shared [`CycleContext`]. In
//! `run` every registered target gets its own task that sleeps until the
//! next deadline and then spawns a cycle. The global concurrency bound is
//! enforced inside the cycle; this module only decides when cycles start
//! and makes sure they stop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::{Config, Target, TargetStatus};
use crate::pipeline::cycle::{ConcurrencyLimiter, CycleContext, CycleOutcome, run_cycle};
use crate::pipeline::detect::ChangeDetector;
use crate::pipeline::dispatch::AlertDispatcher;
use crate::pipeline::guard::ContentGuard;
use crate::pipeline::status::StatusBoard;
use crate::services::{Fetcher, TargetRegistry};
use crate::storage::{HistoryStore, LocalHistoryStore};
use crate::utils::http::create_async_client;

/// Scheduling task of one target.
struct TargetTask {
    handle: JoinHandle<()>,
    stop: CancellationToken,
}

/// Process-scoped monitor.
pub struct Monitor {
    registry: TargetRegistry,
    ctx: Arc<CycleContext>,
    cancel: CancellationToken,
    shutdown_grace: Duration,
}

impl Monitor {
    pub fn new(registry: TargetRegistry, ctx: CycleContext, shutdown_grace: Duration) -> Self {
        Self {
            registry,
            ctx: Arc::new(ctx),
            cancel: CancellationToken::new(),
            shutdown_grace,
        }
    }

    /// Build a monitor backed by the local history store.
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let registry = TargetRegistry::from_config(config)?;
        let store: Arc<dyn HistoryStore> =
            Arc::new(LocalHistoryStore::new(&config.monitor.storage_dir));
        let client = create_async_client(&config.fetch)?;

        let ctx = CycleContext {
            fetcher: Fetcher::from_config(config)?,
            store: Arc::clone(&store),
            detector: ChangeDetector::from_config(&config.detection),
            guard: ContentGuard::new(config.detection.guard.clone()),
            dispatcher: AlertDispatcher::from_config(config, &client, Arc::clone(&store)),
            limiter: ConcurrencyLimiter::new(config.monitor.max_concurrent),
            statuses: StatusBoard::load(store).await?,
            store_timeout: Duration::from_secs(config.monitor.store_timeout_secs),
        };

        log::info!(
            "Monitor ready: {} target(s), {} concurrent cycle(s), classifier '{}'",
            registry.list().len(),
            config.monitor.max_concurrent,
            ctx.detector.classifier_name()
        );

        Ok(Self::new(
            registry,
            ctx,
            Duration::from_secs(config.monitor.shutdown_grace_secs),
        ))
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    pub fn context(&self) -> &CycleContext {
        &self.ctx
    }

    /// Token cancelled on shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask `run` to stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn statuses(&self) -> std::collections::BTreeMap<String, TargetStatus> {
        self.ctx.statuses.snapshot()
    }

    /// Run one cycle for each selected target and wait for all of them.
    ///
    /// An empty selection runs every enabled target.
    pub async fn run_once(&self, target_ids: &[String]) -> Result<Vec<(String, CycleOutcome)>> {
        let targets: Vec<Target> = if target_ids.is_empty() {
            self.registry
                .list()
                .iter()
                .filter(|t| t.enabled)
                .cloned()
                .collect()
        } else {
            target_ids
                .iter()
                .map(|id| self.registry.get(id))
                .collect::<Result<_>>()?
        };

        let runs = targets.iter().map(|target| async move {
            let outcome = run_cycle(&self.ctx, target, &self.cancel).await;
            (target.id.clone(), outcome)
        });
        Ok(join_all(runs).await)
    }

    /// Schedule every target until shutdown.
    ///
    /// Resumes undelivered alerts first, then follows registry changes:
    /// new targets get a task, removed targets have theirs stopped. On
    /// shutdown running cycles get `shutdown_grace` to finish.
    pub async fn run(&self) -> Result<()> {
        let resumed = self.ctx.dispatcher.resume_pending(&self.registry).await;
        if resumed > 0 {
            log::info!("Resumed {} pending alert(s)", resumed);
        }

        let mut tasks: HashMap<String, TargetTask> = HashMap::new();
        let mut changes = self.registry.subscribe();
        let initial = changes.borrow_and_update().clone();
        self.reconcile(&mut tasks, &initial);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let targets = changes.borrow_and_update().clone();
                    self.reconcile(&mut tasks, &targets);
                }
            }
        }

        log::info!(
            "Shutting down; waiting up to {:?} for {} target task(s)",
            self.shutdown_grace,
            tasks.len()
        );
        self.cancel.cancel();
        let handles = tasks.into_values().map(|task| task.handle);
        if tokio::time::timeout(self.shutdown_grace, join_all(handles))
            .await
            .is_err()
        {
            log::warn!("Shutdown grace period elapsed with cycles still running");
        }

        if let Err(e) = self.ctx.statuses.persist().await {
            log::warn!("Failed to persist status on shutdown: {}", e);
        }
        log::info!("Monitor stopped");
        Ok(())
    }

    /// Start tasks for new targets and stop tasks of removed ones.
    fn reconcile(&self, tasks: &mut HashMap<String, TargetTask>, targets: &[Target]) {
        tasks.retain(|id, task| {
            let keep = targets.iter().any(|t| &t.id == id) && !task.handle.is_finished();
            if !keep {
                log::info!("[{}] Target removed; stopping its schedule", id);
                task.stop.cancel();
            }
            keep
        });

        for target in targets {
            if tasks.contains_key(&target.id) {
                continue;
            }
            let stop = self.cancel.child_token();
            let handle = tokio::spawn(target_loop(
                Arc::clone(&self.ctx),
                self.registry.clone(),
                target.id.clone(),
                stop.clone(),
            ));
            log::debug!("[{}] Scheduled every {:?}", target.id, target.fetch_interval);
            tasks.insert(target.id.clone(), TargetTask { handle, stop });
        }
    }
}

/// Trigger cycles for one target on its cadence until stopped.
///
/// The first cycle starts at once. Each later deadline is computed from the
/// target's current definition, so interval changes apply from the next
/// round.
async fn target_loop(
    ctx: Arc<CycleContext>,
    registry: TargetRegistry,
    target_id: String,
    stop: CancellationToken,
) {
    let mut deadline = Instant::now();
    let mut running: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        let Ok(target) = registry.get(&target_id) else {
            break;
        };

        deadline += target.fetch_interval;
        let now = Instant::now();
        if deadline <= now {
            deadline = now + target.fetch_interval;
        }

        if !target.enabled {
            log::debug!("[{}] Disabled; trigger ignored", target_id);
            continue;
        }

        if running.as_ref().is_some_and(|handle| !handle.is_finished()) {
            log::warn!(
                "[{}] Previous cycle still running; trigger skipped",
                target_id
            );
            ctx.statuses.update(&target_id, |s| s.skipped_triggers += 1);
            continue;
        }

        let ctx = Arc::clone(&ctx);
        let cancel = stop.clone();
        running = Some(tokio::spawn(async move {
            let outcome = run_cycle(&ctx, &target, &cancel).await;
            log::debug!("[{}] Cycle finished: {}", target.id, outcome.label());
        }));
    }

    // Running cycles see the same token and finish or abandon on their own
    if let Some(handle) = running {
        if let Err(e) = handle.await {
            log::error!("[{}] Cycle task panicked: {}", target_id, e);
        }
    }
}
