//! Observed page states.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a snapshot: target plus a per-target sequence number.
///
/// Sequence numbers start at 1 and grow by exactly one per appended
/// snapshot, so `seq` doubles as an index into the target's history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId {
    pub target_id: String,
    pub seq: u64,
}

impl SnapshotId {
    pub fn new(target_id: impl Into<String>, seq: u64) -> Self {
        Self {
            target_id: target_id.into(),
            seq,
        }
    }

    /// Identifier of the snapshot that follows this one.
    pub fn next(&self) -> Self {
        Self::new(self.target_id.clone(), self.seq + 1)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.target_id, self.seq)
    }
}

/// Extracted field values; `None` marks a failed extraction.
pub type ExtractedFields = BTreeMap<String, Option<String>>;

/// Comparable form of a fetched page, as produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalForm {
    pub content: String,
    /// Lowercase hex SHA-256 of `content`
    pub hash: String,
    pub extracted_fields: ExtractedFields,
}

impl CanonicalForm {
    pub fn line_count(&self) -> usize {
        self.content.lines().count()
    }

    /// Names of fields whose extraction found nothing.
    pub fn missing_fields(&self) -> Vec<&str> {
        self.extracted_fields
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// An immutable observation of a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub fetched_at: DateTime<Utc>,
    pub canonical_content: String,
    pub content_hash: String,
    #[serde(default)]
    pub extracted_fields: ExtractedFields,
}

impl Snapshot {
    pub fn from_canonical(id: SnapshotId, fetched_at: DateTime<Utc>, form: CanonicalForm) -> Self {
        Self {
            id,
            fetched_at,
            canonical_content: form.content,
            content_hash: form.hash,
            extracted_fields: form.extracted_fields,
        }
    }

    pub fn target_id(&self) -> &str {
        &self.id.target_id
    }

    /// Short hash prefix for log lines.
    pub fn short_hash(&self) -> &str {
        let end = self.content_hash.len().min(8);
        &self.content_hash[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_id_display_and_next() {
        let id = SnapshotId::new("wh347", 4);
        assert_eq!(id.to_string(), "wh347#4");
        assert_eq!(id.next(), SnapshotId::new("wh347", 5));
    }

    #[test]
    fn missing_fields_lists_failed_extractions() {
        let form = CanonicalForm {
            content: "a\nb".into(),
            hash: "00".into(),
            extracted_fields: BTreeMap::from([
                ("rate".to_string(), Some("$15.00".to_string())),
                ("revision".to_string(), None),
            ]),
        };
        assert_eq!(form.missing_fields(), vec!["revision"]);
        assert_eq!(form.line_count(), 2);
    }
}
