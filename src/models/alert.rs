//! Alert delivery state and rendered alert messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::change::{ChangeId, ChangeRecord, Significance};
use super::target::Target;
use crate::error::DeliveryError;

/// Delivery status of an alert on one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Pending,
    Delivered,
    /// Permanent failure; retries exhausted or rejected by the channel
    Failed,
}

impl AlertStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AlertStatus::Delivered | AlertStatus::Failed)
    }
}

/// Delivery of one change record to one channel.
///
/// Each transition is persisted as a new record; the newest record for a
/// `(change_id, channel)` pair is the current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub change_id: ChangeId,
    pub channel: String,
    pub status: AlertStatus,
    pub attempts: u32,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl AlertEvent {
    pub fn pending(change_id: ChangeId, channel: impl Into<String>) -> Self {
        Self {
            change_id,
            channel: channel.into(),
            status: AlertStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
        }
    }

    /// Count a new delivery attempt. Terminal events are left untouched.
    pub fn begin_attempt(&mut self, at: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        self.attempts += 1;
        self.last_attempt_at = Some(at);
    }

    pub fn mark_delivered(&mut self) {
        if self.status == AlertStatus::Pending {
            self.status = AlertStatus::Delivered;
            self.last_error = None;
        }
    }

    /// Record a failed attempt; `exhausted` moves the event to `failed`.
    pub fn record_failure(&mut self, error: &DeliveryError, exhausted: bool) {
        if self.status.is_terminal() {
            return;
        }
        self.last_error = Some(error.to_string());
        if exhausted {
            self.status = AlertStatus::Failed;
        }
    }

    /// Key identifying the delivery this event tracks.
    pub fn key(&self) -> (ChangeId, String) {
        (self.change_id.clone(), self.channel.clone())
    }
}

/// Channel-agnostic alert content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub change_id: String,
    pub target_id: String,
    pub target_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agency: Option<String>,
    pub url: String,
    pub significance: Significance,
    pub detected_at: DateTime<Utc>,
    pub subject: String,
    pub summary: String,
    pub body: String,
}

impl AlertMessage {
    /// Render the alert for a change on a target.
    pub fn for_change(target: &Target, change: &ChangeRecord) -> Self {
        let subject = format!(
            "Payroll Monitor Alert: {} change detected for {}",
            change.significance, target.name
        );
        let summary = change.diff_summary.describe();

        let mut body = String::new();
        body.push_str(&format!("A change has been detected for: {}\n", target.name));
        if let Some(agency) = &target.agency {
            body.push_str(&format!("Agency: {agency}\n"));
        }
        body.push_str(&format!(
            "Detected: {} UTC\n",
            change.detected_at.format("%Y-%m-%d %H:%M:%S")
        ));
        body.push_str(&format!("Severity: {}\n", change.significance));
        body.push_str(&format!("Details: {summary}\n"));
        for field in &change.diff_summary.field_changes {
            body.push_str(&format!(
                "  {}: {} -> {}\n",
                field.name,
                field.before.as_deref().unwrap_or("(missing)"),
                field.after.as_deref().unwrap_or("(missing)")
            ));
        }
        for line in &change.diff_summary.added_sample {
            body.push_str(&format!("  + {line}\n"));
        }
        for line in &change.diff_summary.removed_sample {
            body.push_str(&format!("  - {line}\n"));
        }
        body.push_str(&format!("URL: {}\n", target.url));

        Self {
            change_id: change.id.to_string(),
            target_id: target.id.clone(),
            target_name: target.name.clone(),
            agency: target.agency.clone(),
            url: target.url.clone(),
            significance: change.significance,
            detected_at: change.detected_at,
            subject,
            summary,
            body,
        }
    }

    /// Hex color used by card-style channels.
    pub fn color(&self) -> &'static str {
        match self.significance {
            Significance::Major => "FF0000",
            Significance::Minor => "FFA500",
            Significance::None => "808080",
        }
    }
}
