//! Change detection between consecutive snapshots.

use std::sync::Arc;

use crate::models::{ChangeId, ChangeRecord, DetectionConfig, ExtractionRules, Significance, Snapshot};
use crate::pipeline::classify::{self, Classifier};
use crate::pipeline::diff::ContentDiff;

/// Produces a [`ChangeRecord`] whenever content hashes differ.
#[derive(Clone)]
pub struct ChangeDetector {
    classifier: Arc<dyn Classifier>,
    sample_lines: usize,
}

impl ChangeDetector {
    pub fn new(classifier: Arc<dyn Classifier>, sample_lines: usize) -> Self {
        Self {
            classifier,
            sample_lines,
        }
    }

    pub fn from_config(config: &DetectionConfig) -> Self {
        Self::new(classify::from_config(config), config.sample_lines)
    }

    pub fn classifier_name(&self) -> &'static str {
        self.classifier.name()
    }

    /// Compare `current` against the previous snapshot of the same target.
    ///
    /// Returns `None` for a baseline (no previous snapshot) and for equal
    /// hashes. Any hash difference yields exactly one record, including
    /// records graded `none`. A changed tracked field forces `major`.
    pub fn detect(
        &self,
        previous: Option<&Snapshot>,
        current: &Snapshot,
        rules: &ExtractionRules,
    ) -> Option<ChangeRecord> {
        let previous = previous?;
        if previous.content_hash == current.content_hash {
            return None;
        }

        let diff = ContentDiff::between(previous, current);
        let mut significance = self.classifier.classify(&diff);

        let tracked_changed = diff
            .field_changes
            .iter()
            .any(|change| rules.is_tracked(&change.name));
        if tracked_changed {
            significance = Significance::Major;
        }

        log::debug!(
            "[{}] {} -> {}: {} ({}, {})",
            current.target_id(),
            previous.short_hash(),
            current.short_hash(),
            significance,
            self.classifier.name(),
            if tracked_changed {
                "tracked field changed"
            } else {
                "content only"
            }
        );

        Some(ChangeRecord {
            id: ChangeId::for_snapshot(&current.id),
            from_snapshot: previous.id.clone(),
            to_snapshot: current.id.clone(),
            diff_summary: diff.summary(self.sample_lines),
            significance,
            detected_at: current.fetched_at,
        })
    }
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::from_config(&DetectionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldRule, SnapshotId};
    use crate::utils::content_hash;
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

    fn snapshot(seq: u64, content: &str, rate: Option<&str>) -> Snapshot {
        Snapshot {
            id: SnapshotId::new("wh347", seq),
            fetched_at: Utc::now() + Duration::seconds(seq as i64),
            canonical_content: content.to_string(),
            content_hash: content_hash(content),
            extracted_fields: BTreeMap::from([("rate".to_string(), rate.map(str::to_string))]),
        }
    }

    fn rules(tracked: bool) -> ExtractionRules {
        ExtractionRules {
            suppress: Vec::new(),
            fields: vec![FieldRule {
                name: "rate".into(),
                selector: "#rate".into(),
                attr: None,
                pattern: None,
                tracked,
            }],
        }
    }

    fn long_page(rate: &str) -> String {
        let mut lines: Vec<String> = (0..200).map(|i| format!("Line {i}")).collect();
        lines[100] = format!("Rate: {rate}");
        lines.join("\n")
    }

    #[test]
    fn test_baseline_has_no_change() {
        let detector = ChangeDetector::default();
        let first = snapshot(1, "a", None);
        assert!(detector.detect(None, &first, &rules(true)).is_none());
    }

    #[test]
    fn test_equal_hash_has_no_change() {
        let detector = ChangeDetector::default();
        let a = snapshot(1, "same", Some("$15.00"));
        let b = snapshot(2, "same", Some("$15.00"));
        assert!(detector.detect(Some(&a), &b, &rules(true)).is_none());
    }

    #[test]
    fn test_insignificant_change_still_recorded() {
        let detector = ChangeDetector::default();
        let mut page: Vec<String> = (0..500).map(|i| format!("Line {i}")).collect();
        let before = page.join("\n");
        page[3] = "Line three".into();
        let after = page.join("\n");

        let a = snapshot(1, &before, Some("$15.00"));
        let b = snapshot(2, &after, Some("$15.00"));
        let change = detector.detect(Some(&a), &b, &rules(true)).unwrap();
        assert_eq!(change.significance, Significance::None);
        assert_eq!(change.id.seq, 2);
        assert_eq!(change.from_snapshot, a.id);
        assert_eq!(change.to_snapshot, b.id);
    }

    #[test]
    fn test_tracked_field_forces_major() {
        let detector = ChangeDetector::default();
        let a = snapshot(1, &long_page("$15.00"), Some("$15.00"));
        let b = snapshot(2, &long_page("$16.50"), Some("$16.50"));

        let change = detector.detect(Some(&a), &b, &rules(true)).unwrap();
        assert_eq!(change.significance, Significance::Major);
        assert_eq!(change.diff_summary.field_changes.len(), 1);

        let untracked = detector.detect(Some(&a), &b, &rules(false)).unwrap();
        assert_eq!(untracked.significance, Significance::Minor);
    }
}
