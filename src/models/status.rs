//! Operator-visible per-target cycle status.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Per-target cycle state machine.
///
/// `Idle -> Fetching -> Detecting -> (Alerting) -> Idle`, with
/// `Fetching -> Failed -> Idle` when content cannot be acquired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    #[default]
    Idle,
    Fetching,
    Detecting,
    Alerting,
    Failed,
}

impl CycleState {
    /// States that count against the global concurrency limit.
    pub fn is_active(&self) -> bool {
        matches!(self, CycleState::Fetching | CycleState::Detecting)
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CycleState::Idle => "idle",
            CycleState::Fetching => "fetching",
            CycleState::Detecting => "detecting",
            CycleState::Alerting => "alerting",
            CycleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Last error reported for a target, reduced to kind and reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusError {
    pub kind: ErrorKind,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Status of one target as shown to operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetStatus {
    #[serde(default)]
    pub state: CycleState,
    #[serde(default)]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<StatusError>,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Consecutive cycles rejected by the content guard
    #[serde(default)]
    pub guard_trips: u32,
    #[serde(default)]
    pub skipped_triggers: u64,
    /// Set by permanent fetch failures, cleared by the next success
    #[serde(default)]
    pub needs_attention: bool,
}

impl TargetStatus {
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.state = CycleState::Idle;
        self.last_success_at = Some(at);
        self.consecutive_failures = 0;
        self.guard_trips = 0;
        self.needs_attention = false;
    }

    pub fn record_failure(&mut self, kind: ErrorKind, at: DateTime<Utc>) {
        self.last_failure_at = Some(at);
        self.last_error = Some(StatusError {
            kind,
            reason: kind.reason().to_string(),
            at,
        });
        self.consecutive_failures += 1;
        if kind == ErrorKind::PermanentFetch {
            self.needs_attention = true;
        }
    }

    /// Delivery problems are reported without failing the cycle.
    pub fn record_delivery_failure(&mut self, at: DateTime<Utc>) {
        self.last_failure_at = Some(at);
        self.last_error = Some(StatusError {
            kind: ErrorKind::Delivery,
            reason: ErrorKind::Delivery.reason().to_string(),
            at,
        });
    }
}
