// src/models/mod.rs

//! Domain models for the monitor.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod alert;
mod change;
mod config;
mod snapshot;
mod status;
mod target;

// Re-export all public types
pub use alert::{AlertEvent, AlertMessage, AlertStatus};
pub use change::{ChangeId, ChangeRecord, DiffSummary, FieldChange, Significance};
pub use config::{
    AlertConfig, ChannelConfig, ChannelKind, ClassifierKind, Config, DetectionConfig,
    FetchConfig, FetchInterval, Frequency, GuardConfig, MonitorConfig, RenderConfig, RetryConfig,
    ScoringConfig, TargetConfig, TargetDefaults,
};
pub use snapshot::{CanonicalForm, ExtractedFields, Snapshot, SnapshotId};
pub use status::{CycleState, StatusError, TargetStatus};
pub use target::{
    ChannelRef, ExtractionRules, FieldRule, Readiness, RenderMode, SuppressRule, Target,
};

#[cfg(test)]
pub(crate) use target::fixtures;
