//! Line and field diff between two snapshots.
//!
//! Canonical content is compared line by line: the common prefix and
//! suffix are trimmed, then the remaining middle sections are compared as
//! multisets. A line that moved inside the changed region is therefore not
//! counted, while duplicated lines are counted with their multiplicity.

use std::collections::{BTreeSet, HashMap};

use crate::models::{DiffSummary, ExtractedFields, FieldChange, Snapshot};

/// Difference between the canonical content of two snapshots.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContentDiff {
    pub lines_before: usize,
    pub lines_after: usize,
    /// Lines present only in the newer content, in document order
    pub added: Vec<String>,
    /// Lines present only in the older content, in document order
    pub removed: Vec<String>,
    pub field_changes: Vec<FieldChange>,
}

impl ContentDiff {
    /// Diff two snapshots of the same target.
    pub fn between(previous: &Snapshot, current: &Snapshot) -> Self {
        let mut diff = Self::lines(&previous.canonical_content, &current.canonical_content);
        diff.field_changes = field_changes(&previous.extracted_fields, &current.extracted_fields);
        diff
    }

    /// Diff two canonical texts.
    pub fn lines(before: &str, after: &str) -> Self {
        let before: Vec<&str> = before.lines().collect();
        let after: Vec<&str> = after.lines().collect();

        let prefix = before
            .iter()
            .zip(after.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let suffix = before[prefix..]
            .iter()
            .rev()
            .zip(after[prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .count();

        let old_middle = &before[prefix..before.len() - suffix];
        let new_middle = &after[prefix..after.len() - suffix];

        Self {
            lines_before: before.len(),
            lines_after: after.len(),
            added: multiset_difference(new_middle, old_middle),
            removed: multiset_difference(old_middle, new_middle),
            field_changes: Vec::new(),
        }
    }

    /// Number of added plus removed lines.
    pub fn changed_lines(&self) -> usize {
        self.added.len() + self.removed.len()
    }

    /// Changed lines relative to the longer version, capped at 1.0.
    pub fn change_ratio(&self) -> f64 {
        let total = self.lines_before.max(self.lines_after).max(1);
        (self.changed_lines() as f64 / total as f64).min(1.0)
    }

    /// Check if there are any changes.
    pub fn has_changes(&self) -> bool {
        self.changed_lines() > 0 || !self.field_changes.is_empty()
    }

    /// Iterate over every added and removed line.
    pub fn changed(&self) -> impl Iterator<Item = &str> {
        self.added
            .iter()
            .chain(self.removed.iter())
            .map(String::as_str)
    }

    /// Persisted form, with at most `sample_lines` added and removed lines.
    pub fn summary(&self, sample_lines: usize) -> DiffSummary {
        DiffSummary {
            lines_before: self.lines_before,
            lines_after: self.lines_after,
            lines_added: self.added.len(),
            lines_removed: self.removed.len(),
            change_ratio: self.change_ratio(),
            field_changes: self.field_changes.clone(),
            added_sample: self.added.iter().take(sample_lines).cloned().collect(),
            removed_sample: self.removed.iter().take(sample_lines).cloned().collect(),
        }
    }
}

/// Lines of `left` not matched by an occurrence in `right`, in `left` order.
fn multiset_difference(left: &[&str], right: &[&str]) -> Vec<String> {
    let mut remaining: HashMap<&str, usize> = HashMap::new();
    for line in right {
        *remaining.entry(line).or_default() += 1;
    }

    left.iter()
        .filter(|line| match remaining.get_mut(*line) {
            Some(count) if *count > 0 => {
                *count -= 1;
                false
            }
            _ => true,
        })
        .map(|line| line.to_string())
        .collect()
}

/// Fields whose value differs; a field absent on one side counts as `None`.
fn field_changes(before: &ExtractedFields, after: &ExtractedFields) -> Vec<FieldChange> {
    let names: BTreeSet<&String> = before.keys().chain(after.keys()).collect();

    names
        .into_iter()
        .filter_map(|name| {
            let old = before.get(name).cloned().flatten();
            let new = after.get(name).cloned().flatten();
            (old != new).then(|| FieldChange {
                name: name.clone(),
                before: old,
                after: new,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn fields(pairs: &[(&str, Option<&str>)]) -> ExtractedFields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect::<BTreeMap<_, _>>()
    }

    #[test]
    fn test_no_changes() {
        let diff = ContentDiff::lines("a\nb\nc", "a\nb\nc");
        assert!(!diff.has_changes());
        assert_eq!(diff.change_ratio(), 0.0);
    }

    #[test]
    fn test_single_line_replaced() {
        let diff = ContentDiff::lines("title\nRate: $15.00\nfooter", "title\nRate: $16.50\nfooter");
        assert_eq!(diff.added, vec!["Rate: $16.50"]);
        assert_eq!(diff.removed, vec!["Rate: $15.00"]);
        assert!((diff.change_ratio() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_additions() {
        let diff = ContentDiff::lines("a\nb", "a\nnew\nb");
        assert_eq!(diff.added, vec!["new"]);
        assert!(diff.removed.is_empty());
        assert_eq!(diff.lines_after, 3);
    }

    #[test]
    fn test_moved_lines_not_counted() {
        let diff = ContentDiff::lines("head\nx\ny\nz\ntail", "head\nz\nx\ny\ntail");
        assert!(!diff.has_changes());
    }

    #[test]
    fn test_duplicates_counted() {
        let diff = ContentDiff::lines("a\nrow\nb", "a\nrow\nrow\nrow\nb");
        assert_eq!(diff.added, vec!["row", "row"]);
    }

    #[test]
    fn test_empty_to_full() {
        let diff = ContentDiff::lines("", "one\ntwo");
        assert_eq!(diff.added.len(), 2);
        assert_eq!(diff.change_ratio(), 1.0);
    }

    #[test]
    fn test_full_rewrite_ratio_capped() {
        let diff = ContentDiff::lines("a\nb", "c\nd");
        assert_eq!(diff.changed_lines(), 4);
        assert_eq!(diff.change_ratio(), 1.0);
    }

    #[test]
    fn test_field_vanishing_is_change() {
        let changes = field_changes(
            &fields(&[("rate", Some("$15.00")), ("rev", Some("01/2024"))]),
            &fields(&[("rate", None), ("rev", Some("01/2024"))]),
        );
        assert_eq!(
            changes,
            vec![FieldChange {
                name: "rate".into(),
                before: Some("$15.00".into()),
                after: None,
            }]
        );
    }

    #[test]
    fn test_missing_key_equals_none() {
        let changes = field_changes(&fields(&[("rate", None)]), &fields(&[]));
        assert!(changes.is_empty());
    }

    #[test]
    fn test_summary_samples() {
        let diff = ContentDiff::lines("x", "a\nb\nc");
        let summary = diff.summary(2);
        assert_eq!(summary.lines_added, 3);
        assert_eq!(summary.lines_removed, 1);
        assert_eq!(summary.added_sample, vec!["a", "b"]);
        assert_eq!(summary.removed_sample, vec!["x"]);
    }
}
