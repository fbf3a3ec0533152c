//! Alert dispatch.
//!
//! Delivers a change record to every channel of its target. Channels run
//! concurrently and independently; each keeps its own retry budget and its
//! own [`AlertEvent`] history in the store. An event is persisted as
//! `pending` before the first attempt, so a restart can find and resume
//! deliveries that never reached a terminal state. Change records that
//! never got that far are found by scanning the target's history.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use reqwest::Client;

use crate::error::DeliveryError;
use crate::models::{AlertEvent, AlertMessage, ChangeId, ChangeRecord, Config, Target};
use crate::services::{ChannelRegistry, TargetRegistry};
use crate::storage::HistoryStore;
use crate::utils::retry::RetryPolicy;

/// A delivery that ended without success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub channel: String,
    pub error: DeliveryError,
}

/// Outcome of dispatching one change.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// Final event state per channel
    pub events: Vec<AlertEvent>,
    pub failures: Vec<DeliveryFailure>,
}

impl DispatchReport {
    pub fn all_delivered(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Delivers alerts with per-channel retry and state tracking.
#[derive(Clone)]
pub struct AlertDispatcher {
    channels: ChannelRegistry,
    store: Arc<dyn HistoryStore>,
    retry: RetryPolicy,
    send_timeout: Duration,
    operator_channel: Option<String>,
}

impl AlertDispatcher {
    pub fn new(
        channels: ChannelRegistry,
        store: Arc<dyn HistoryStore>,
        retry: RetryPolicy,
        send_timeout: Duration,
        operator_channel: Option<String>,
    ) -> Self {
        Self {
            channels,
            store,
            retry,
            send_timeout,
            operator_channel,
        }
    }

    /// Build the dispatcher from `[alerts]` and `[[channels]]`.
    pub fn from_config(config: &Config, client: &Client, store: Arc<dyn HistoryStore>) -> Self {
        Self::new(
            ChannelRegistry::from_config(&config.channels, client),
            store,
            config.alerts.retry.policy(),
            Duration::from_secs(config.alerts.send_timeout_secs),
            config.alerts.operator_channel.clone(),
        )
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Deliver a change to all channels of its target.
    ///
    /// Channels already holding a terminal event for this change are not
    /// contacted again.
    pub async fn dispatch(&self, change: &ChangeRecord, target: &Target) -> DispatchReport {
        let existing = self.existing_events(target).await;
        let message = AlertMessage::for_change(target, change);

        let deliveries = target.channels.iter().map(|channel| {
            let prior = existing.get(&(change.id.clone(), channel.clone())).cloned();
            self.deliver(&change.id, channel, &message, prior)
        });
        let results = join_all(deliveries).await;

        let report = collect(results);
        self.report_failures(target, change, &report).await;
        report
    }

    /// Finish the unfinished deliveries of every registered target.
    ///
    /// Returns the number of deliveries attempted.
    pub async fn resume_pending(&self, registry: &TargetRegistry) -> usize {
        let mut resumed = 0;
        for target in registry.list().iter() {
            resumed += self.resume_target(target).await;
        }
        resumed
    }

    /// Finish the unfinished deliveries of one target.
    ///
    /// Covers non-terminal events, and alert-worthy change records that
    /// were committed without any event (the process stopped, or the store
    /// gave up, between the append and the first `pending` record). A
    /// change that already has events is not offered to channels added
    /// since.
    pub async fn resume_target(&self, target: &Target) -> usize {
        let events = match self.store.alerts(&target.id).await {
            Ok(events) => events,
            Err(e) => {
                log::error!("[{}] Failed to read alert events: {}", target.id, e);
                return 0;
            }
        };
        let changes = match self
            .store
            .changes(&target.id, DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)
            .await
        {
            Ok(changes) => changes,
            Err(e) => {
                log::error!("[{}] Failed to read change records: {}", target.id, e);
                return 0;
            }
        };

        let alerted: HashSet<ChangeId> = events.iter().map(|e| e.change_id.clone()).collect();
        let mut work: BTreeMap<ChangeId, Vec<(String, Option<AlertEvent>)>> = BTreeMap::new();
        for event in events.into_iter().filter(|e| !e.status.is_terminal()) {
            work.entry(event.change_id.clone())
                .or_default()
                .push((event.channel.clone(), Some(event)));
        }

        let mut records = HashMap::new();
        for change in changes {
            if !alerted.contains(&change.id)
                && target.should_alert(change.significance)
                && !target.channels.is_empty()
            {
                log::warn!(
                    "[{}] Change {} was stored without alert events",
                    target.id,
                    change.id
                );
                work.entry(change.id.clone())
                    .or_default()
                    .extend(target.channels.iter().map(|channel| (channel.clone(), None)));
            }
            records.insert(change.id.clone(), change);
        }

        let mut resumed = 0;
        for (change_id, deliveries) in work {
            let change = match records.remove(&change_id) {
                Some(change) => change,
                None => match self.store.change(&change_id).await {
                    Ok(Some(change)) => change,
                    Ok(None) => {
                        log::warn!(
                            "[{}] Pending alert for unknown change {}; skipped",
                            target.id,
                            change_id
                        );
                        continue;
                    }
                    Err(e) => {
                        log::error!("[{}] Failed to load change {}: {}", target.id, change_id, e);
                        continue;
                    }
                },
            };

            log::info!(
                "[{}] Resuming {} alert(s) for {}",
                target.id,
                deliveries.len(),
                change_id
            );
            resumed += deliveries.len();

            let message = AlertMessage::for_change(target, &change);
            let results = join_all(deliveries.into_iter().map(|(channel, prior)| {
                let change_id = &change.id;
                let message = &message;
                async move { self.deliver(change_id, &channel, message, prior).await }
            }))
            .await;
            let report = collect(results);
            self.report_failures(target, &change, &report).await;
        }

        resumed
    }

    async fn existing_events(&self, target: &Target) -> HashMap<(ChangeId, String), AlertEvent> {
        match self.store.alerts(&target.id).await {
            Ok(events) => events.into_iter().map(|e| (e.key(), e)).collect(),
            Err(e) => {
                log::warn!("[{}] Failed to read alert events: {}", target.id, e);
                HashMap::new()
            }
        }
    }

    /// Run one channel's delivery to a terminal state or budget exhaustion.
    async fn deliver(
        &self,
        change_id: &ChangeId,
        channel_name: &str,
        message: &AlertMessage,
        prior: Option<AlertEvent>,
    ) -> (AlertEvent, Option<DeliveryError>) {
        let mut event = match prior {
            Some(event) if event.status.is_terminal() => return (event, None),
            Some(event) => event,
            None => {
                let event = AlertEvent::pending(change_id.clone(), channel_name);
                self.persist(&event).await;
                event
            }
        };

        let Some(channel) = self.channels.get(channel_name) else {
            let error = DeliveryError::Permanent(format!("unknown channel '{channel_name}'"));
            event.record_failure(&error, true);
            self.persist(&event).await;
            log::error!("[{}] {}: {}", message.target_id, change_id, error);
            return (event, Some(error));
        };

        let first_attempt = event.attempts;
        loop {
            event.begin_attempt(Utc::now());
            self.persist(&event).await;

            let result = match tokio::time::timeout(self.send_timeout, channel.send(message)).await
            {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Retryable(format!(
                    "send timed out after {:?}",
                    self.send_timeout
                ))),
            };

            let attempts_this_run = event.attempts - first_attempt;
            match result {
                Ok(()) => {
                    event.mark_delivered();
                    self.persist(&event).await;
                    log::info!(
                        "[{}] Alert {} delivered via {} (attempt {})",
                        message.target_id,
                        change_id,
                        channel_name,
                        event.attempts
                    );
                    return (event, None);
                }
                Err(error) => {
                    let exhausted =
                        !error.is_retryable() || !self.retry.allows_retry(attempts_this_run);
                    event.record_failure(&error, exhausted);
                    self.persist(&event).await;

                    if exhausted {
                        log::error!(
                            "[{}] Alert {} failed on {} after {} attempt(s): {}",
                            message.target_id,
                            change_id,
                            channel_name,
                            event.attempts,
                            error
                        );
                        return (event, Some(error));
                    }

                    let delay = self.retry.delay_for(attempts_this_run);
                    log::warn!(
                        "[{}] Alert {} on {} failed ({}); retrying in {:?}",
                        message.target_id,
                        change_id,
                        channel_name,
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn persist(&self, event: &AlertEvent) {
        if let Err(e) = self.store.record_alert(event).await {
            log::error!(
                "[{}] Failed to record alert event on {}: {}",
                event.change_id.target_id,
                event.channel,
                e
            );
        }
    }

    /// Tell the operator channel about failed deliveries, best-effort.
    async fn report_failures(&self, target: &Target, change: &ChangeRecord, report: &DispatchReport) {
        if report.failures.is_empty() {
            return;
        }
        let Some(operator) = &self.operator_channel else {
            return;
        };
        if report.failures.iter().any(|f| &f.channel == operator) {
            return;
        }
        let Some(channel) = self.channels.get(operator) else {
            log::warn!("Operator channel '{}' is not configured", operator);
            return;
        };

        let mut message = AlertMessage::for_change(target, change);
        message.subject = format!(
            "Payroll Monitor: alert delivery failed for {}",
            target.name
        );
        let mut body = format!("Alert {} could not be delivered:\n", change.id);
        for failure in &report.failures {
            body.push_str(&format!("  {}: {}\n", failure.channel, failure.error));
        }
        message.body = body;

        match tokio::time::timeout(self.send_timeout, channel.send(&message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("[{}] Operator notification failed: {}", target.id, e),
            Err(_) => log::warn!("[{}] Operator notification timed out", target.id),
        }
    }
}

fn collect(results: Vec<(AlertEvent, Option<DeliveryError>)>) -> DispatchReport {
    let mut report = DispatchReport::default();
    for (event, error) in results {
        if let Some(error) = error {
            report.failures.push(DeliveryFailure {
                channel: event.channel.clone(),
                error,
            });
        }
        report.events.push(event);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AlertStatus, DiffSummary, Significance, Snapshot, SnapshotId, fixtures,
    };
    use crate::services::channels::testing::RecordingChannel;
    use crate::storage::LocalHistoryStore;
    use std::collections::BTreeSet;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Harness {
        _temp: TempDir,
        store: Arc<dyn HistoryStore>,
    }

    impl Harness {
        /// A store holding two snapshots of `wh347` and the change between them.
        async fn new() -> (Self, ChangeRecord) {
            let temp = TempDir::new().unwrap();
            let store: Arc<dyn HistoryStore> = Arc::new(LocalHistoryStore::new(temp.path()));

            let now = Utc::now();
            let first = snapshot(1, "a", now);
            let second = snapshot(2, "b", now + chrono::Duration::seconds(1));
            let change = ChangeRecord {
                id: ChangeId::for_snapshot(&second.id),
                from_snapshot: first.id.clone(),
                to_snapshot: second.id.clone(),
                diff_summary: DiffSummary::default(),
                significance: Significance::Major,
                detected_at: second.fetched_at,
            };
            store.append(first, None).await.unwrap();
            store.append(second, Some(change.clone())).await.unwrap();

            (Self { _temp: temp, store }, change)
        }

        fn dispatcher(&self, channels: Vec<Arc<RecordingChannel>>, operator: Option<&str>) -> AlertDispatcher {
            let mut registry = ChannelRegistry::default();
            for channel in channels {
                registry.insert(channel);
            }
            AlertDispatcher::new(
                registry,
                Arc::clone(&self.store),
                RetryPolicy::immediate(3),
                Duration::from_secs(1),
                operator.map(str::to_string),
            )
        }
    }

    fn snapshot(seq: u64, content: &str, at: chrono::DateTime<Utc>) -> Snapshot {
        Snapshot {
            id: SnapshotId::new("wh347", seq),
            fetched_at: at,
            canonical_content: content.to_string(),
            content_hash: crate::utils::content_hash(content),
            extracted_fields: Default::default(),
        }
    }

    fn target(channels: &[&str]) -> Target {
        let mut target = fixtures::target("wh347");
        target.channels = channels.iter().map(|c| c.to_string()).collect::<BTreeSet<_>>();
        target
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_until_delivered() {
        let (harness, change) = Harness::new().await;
        let flaky = Arc::new(RecordingChannel::failing(
            "slack",
            1,
            DeliveryError::Retryable("503".into()),
        ));
        let dispatcher = harness.dispatcher(vec![Arc::clone(&flaky)], None);

        let report = dispatcher.dispatch(&change, &target(&["slack"])).await;
        assert!(report.all_delivered());
        assert_eq!(report.events[0].status, AlertStatus::Delivered);
        assert_eq!(report.events[0].attempts, 2);
        assert_eq!(flaky.delivered_count(), 1);

        let stored = harness.store.alerts("wh347").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, AlertStatus::Delivered);
    }

    #[tokio::test]
    async fn test_channels_fail_independently() {
        let (harness, change) = Harness::new().await;
        let good = Arc::new(RecordingChannel::new("log"));
        let rejected = Arc::new(RecordingChannel::failing(
            "webhook",
            usize::MAX,
            DeliveryError::Permanent("400".into()),
        ));
        let dispatcher =
            harness.dispatcher(vec![Arc::clone(&good), Arc::clone(&rejected)], None);

        let report = dispatcher.dispatch(&change, &target(&["log", "webhook"])).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].channel, "webhook");
        assert_eq!(good.delivered_count(), 1);
        // Permanent errors are not retried
        assert_eq!(rejected.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_and_notify_operator() {
        let (harness, change) = Harness::new().await;
        let down = Arc::new(RecordingChannel::failing(
            "teams",
            usize::MAX,
            DeliveryError::Retryable("503".into()),
        ));
        let operator = Arc::new(RecordingChannel::new("ops"));
        let dispatcher =
            harness.dispatcher(vec![Arc::clone(&down), Arc::clone(&operator)], Some("ops"));

        let report = dispatcher.dispatch(&change, &target(&["teams"])).await;
        assert_eq!(report.events[0].status, AlertStatus::Failed);
        assert_eq!(report.events[0].attempts, 3);
        assert_eq!(down.calls.load(Ordering::SeqCst), 3);

        let notices = operator.delivered.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].body.contains("teams"));
    }

    #[tokio::test]
    async fn test_unknown_channel_is_permanent_failure() {
        let (harness, change) = Harness::new().await;
        let dispatcher = harness.dispatcher(Vec::new(), None);

        let report = dispatcher.dispatch(&change, &target(&["email"])).await;
        assert_eq!(report.failures.len(), 1);
        assert!(!report.failures[0].error.is_retryable());
    }

    #[tokio::test]
    async fn test_terminal_events_are_not_redelivered() {
        let (harness, change) = Harness::new().await;
        let channel = Arc::new(RecordingChannel::new("log"));
        let dispatcher = harness.dispatcher(vec![Arc::clone(&channel)], None);

        dispatcher.dispatch(&change, &target(&["log"])).await;
        dispatcher.dispatch(&change, &target(&["log"])).await;
        assert_eq!(channel.delivered_count(), 1);
    }

    #[tokio::test]
    async fn test_resume_pending_redelivers() {
        let (harness, change) = Harness::new().await;
        harness
            .store
            .record_alert(&AlertEvent::pending(change.id.clone(), "slack"))
            .await
            .unwrap();

        let channel = Arc::new(RecordingChannel::new("slack"));
        let dispatcher = harness.dispatcher(vec![Arc::clone(&channel)], None);
        let registry = TargetRegistry::new(vec![target(&["slack"])]).unwrap();

        assert_eq!(dispatcher.resume_pending(&registry).await, 1);
        assert_eq!(channel.delivered_count(), 1);
        let stored = harness.store.alerts("wh347").await.unwrap();
        assert_eq!(stored[0].status, AlertStatus::Delivered);

        // Nothing left to resume
        assert_eq!(dispatcher.resume_pending(&registry).await, 0);
    }

    #[tokio::test]
    async fn test_resume_delivers_change_stored_without_events() {
        // The harness commits a major change and stops before dispatching
        let (harness, change) = Harness::new().await;
        let slack = Arc::new(RecordingChannel::new("slack"));
        let log = Arc::new(RecordingChannel::new("log"));
        let dispatcher = harness.dispatcher(vec![Arc::clone(&slack), Arc::clone(&log)], None);
        let registry = TargetRegistry::new(vec![target(&["log", "slack"])]).unwrap();

        assert_eq!(dispatcher.resume_pending(&registry).await, 2);
        assert_eq!(slack.delivered_count(), 1);
        assert_eq!(log.delivered_count(), 1);

        let stored = harness.store.alerts("wh347").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|e| e.change_id == change.id));
        assert!(stored.iter().all(|e| e.status == AlertStatus::Delivered));

        assert_eq!(dispatcher.resume_pending(&registry).await, 0);
    }

    #[tokio::test]
    async fn test_resume_skips_changes_below_threshold() {
        let (harness, change) = Harness::new().await;
        let third = snapshot(3, "c", change.detected_at + chrono::Duration::seconds(1));
        let minor = ChangeRecord {
            id: ChangeId::for_snapshot(&third.id),
            from_snapshot: change.to_snapshot.clone(),
            to_snapshot: third.id.clone(),
            diff_summary: DiffSummary::default(),
            significance: Significance::Minor,
            detected_at: third.fetched_at,
        };
        harness.store.append(third, Some(minor)).await.unwrap();

        let channel = Arc::new(RecordingChannel::new("log"));
        let dispatcher = harness.dispatcher(vec![Arc::clone(&channel)], None);
        assert_eq!(dispatcher.resume_target(&target(&["log"])).await, 1);

        let delivered = channel.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].change_id, change.id.to_string());
    }

    #[tokio::test]
    async fn test_resume_does_not_offer_alerted_change_to_new_channel() {
        let (harness, change) = Harness::new().await;
        let log = Arc::new(RecordingChannel::new("log"));
        let slack = Arc::new(RecordingChannel::new("slack"));
        let dispatcher = harness.dispatcher(vec![Arc::clone(&log), Arc::clone(&slack)], None);

        dispatcher.dispatch(&change, &target(&["log"])).await;
        assert_eq!(dispatcher.resume_target(&target(&["log", "slack"])).await, 0);
        assert_eq!(slack.delivered_count(), 0);
    }
}
