//! Detected changes between consecutive snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::snapshot::SnapshotId;

/// How much a change matters.
///
/// Ordered so that thresholds compare with `>=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Significance {
    None,
    Minor,
    Major,
}

impl Significance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Significance::None => "none",
            Significance::Minor => "minor",
            Significance::Major => "major",
        }
    }
}

impl fmt::Display for Significance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a change record. Shares `seq` with the snapshot it leads to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeId {
    pub target_id: String,
    pub seq: u64,
}

impl ChangeId {
    pub fn for_snapshot(to: &SnapshotId) -> Self {
        Self {
            target_id: to.target_id.clone(),
            seq: to.seq,
        }
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.target_id, self.seq)
    }
}

/// A single extracted field whose value differs between snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub name: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

/// Persisted summary of a content diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DiffSummary {
    pub lines_before: usize,
    pub lines_after: usize,
    pub lines_added: usize,
    pub lines_removed: usize,
    /// Changed lines over total lines of both versions, in `0.0..=1.0`
    pub change_ratio: f64,
    #[serde(default)]
    pub field_changes: Vec<FieldChange>,
    /// First added lines, for alert bodies
    #[serde(default)]
    pub added_sample: Vec<String>,
    /// First removed lines, for alert bodies
    #[serde(default)]
    pub removed_sample: Vec<String>,
}

impl DiffSummary {
    /// One-line description used in alerts and CLI output.
    pub fn describe(&self) -> String {
        let mut text = format!(
            "{} line(s) added, {} removed ({:.1}% changed)",
            self.lines_added,
            self.lines_removed,
            self.change_ratio * 100.0
        );
        if !self.field_changes.is_empty() {
            let names: Vec<&str> = self.field_changes.iter().map(|c| c.name.as_str()).collect();
            text.push_str(&format!("; fields changed: {}", names.join(", ")));
        }
        text
    }
}

/// Immutable record of a content change between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: ChangeId,
    pub from_snapshot: SnapshotId,
    pub to_snapshot: SnapshotId,
    pub diff_summary: DiffSummary,
    pub significance: Significance,
    pub detected_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn target_id(&self) -> &str {
        &self.id.target_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn significance_ordering() {
        assert!(Significance::None < Significance::Minor);
        assert!(Significance::Minor < Significance::Major);
    }

    #[test]
    fn significance_parses_lowercase() {
        let parsed: Significance = serde_json::from_str("\"major\"").unwrap();
        assert_eq!(parsed, Significance::Major);
    }

    #[test]
    fn describe_mentions_fields() {
        let summary = DiffSummary {
            lines_before: 10,
            lines_after: 10,
            lines_added: 1,
            lines_removed: 1,
            change_ratio: 0.1,
            field_changes: vec![FieldChange {
                name: "wage_rate".into(),
                before: Some("$15.00".into()),
                after: Some("$16.50".into()),
            }],
            ..Default::default()
        };
        assert_eq!(
            summary.describe(),
            "1 line(s) added, 1 removed (10.0% changed); fields changed: wage_rate"
        );
    }
}
