//! Significance classification of content diffs.

use std::sync::Arc;

use crate::models::{ClassifierKind, DetectionConfig, ScoringConfig, Significance};
use crate::pipeline::diff::ContentDiff;

/// Grades a diff into a significance bucket.
pub trait Classifier: Send + Sync {
    fn classify(&self, diff: &ContentDiff) -> Significance;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Build the classifier selected in `[detection]`.
pub fn from_config(config: &DetectionConfig) -> Arc<dyn Classifier> {
    match config.classifier {
        ClassifierKind::Rules => Arc::new(RuleClassifier::new(config.minor_ratio, config.major_ratio)),
        ClassifierKind::Scoring => Arc::new(ScoringClassifier::new(&config.scoring)),
    }
}

/// Threshold rules over the change ratio.
#[derive(Debug, Clone)]
pub struct RuleClassifier {
    minor_ratio: f64,
    major_ratio: f64,
}

impl RuleClassifier {
    pub fn new(minor_ratio: f64, major_ratio: f64) -> Self {
        Self {
            minor_ratio,
            major_ratio,
        }
    }
}

impl Default for RuleClassifier {
    fn default() -> Self {
        Self::new(0.01, 0.25)
    }
}

impl Classifier for RuleClassifier {
    fn classify(&self, diff: &ContentDiff) -> Significance {
        let ratio = diff.change_ratio();
        if diff.changed_lines() > 0 && ratio >= self.major_ratio {
            Significance::Major
        } else if diff.changed_lines() > 0 && ratio >= self.minor_ratio {
            Significance::Minor
        } else if !diff.field_changes.is_empty() {
            Significance::Minor
        } else {
            Significance::None
        }
    }

    fn name(&self) -> &'static str {
        "rules"
    }
}

/// Weighted score over diff features.
///
/// `score = ratio_weight * ratio + volume_weight * ln(1 + changed_lines)
///        + keyword_weight * keyword_lines`, where `keyword_lines` counts
/// changed lines mentioning any keyword.
#[derive(Debug, Clone)]
pub struct ScoringClassifier {
    ratio_weight: f64,
    volume_weight: f64,
    keyword_weight: f64,
    minor_cutoff: f64,
    major_cutoff: f64,
    keywords: Vec<String>,
}

impl ScoringClassifier {
    pub fn new(config: &ScoringConfig) -> Self {
        Self {
            ratio_weight: config.ratio_weight,
            volume_weight: config.volume_weight,
            keyword_weight: config.keyword_weight,
            minor_cutoff: config.minor_cutoff,
            major_cutoff: config.major_cutoff,
            keywords: config.keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    pub fn score(&self, diff: &ContentDiff) -> f64 {
        let keyword_lines = diff
            .changed()
            .filter(|line| {
                let lower = line.to_lowercase();
                self.keywords.iter().any(|k| lower.contains(k.as_str()))
            })
            .count();

        self.ratio_weight * diff.change_ratio()
            + self.volume_weight * (1.0 + diff.changed_lines() as f64).ln()
            + self.keyword_weight * keyword_lines as f64
    }
}

impl Classifier for ScoringClassifier {
    fn classify(&self, diff: &ContentDiff) -> Significance {
        if !diff.has_changes() {
            return Significance::None;
        }

        let score = self.score(diff);
        if score >= self.major_cutoff {
            Significance::Major
        } else if score >= self.minor_cutoff || !diff.field_changes.is_empty() {
            Significance::Minor
        } else {
            Significance::None
        }
    }

    fn name(&self) -> &'static str {
        "scoring"
    }
}
