//! Monitored target definitions.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::change::Significance;

/// Reference to a configured notification channel, by name.
pub type ChannelRef = String;

/// A monitored web resource, fully resolved against configuration defaults.
///
/// Targets are immutable for the duration of a cycle. The registry swaps
/// whole target sets on reload; the pipeline never mutates a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Stable identifier, also used as the storage directory name
    pub id: String,

    /// Display name (form number or page title)
    pub name: String,

    /// Page to fetch
    pub url: String,

    /// Owning agency, shown in alerts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agency: Option<String>,

    pub render_mode: RenderMode,

    /// Readiness condition for dynamic rendering
    pub readiness: Readiness,

    pub extraction: ExtractionRules,

    /// Time between cycle starts
    #[serde(with = "duration_secs")]
    pub fetch_interval: Duration,

    /// Lowest significance that triggers alerts
    pub significance_threshold: Significance,

    /// Channels alerted for this target
    pub channels: BTreeSet<ChannelRef>,

    /// Disabled targets keep their history but are not scheduled
    pub enabled: bool,
}

impl Target {
    /// Whether a change of the given significance should be alerted.
    ///
    /// `none` never alerts, whatever the threshold.
    pub fn should_alert(&self, significance: Significance) -> bool {
        significance != Significance::None && significance >= self.significance_threshold
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// How the page content is acquired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// Plain HTTP GET
    #[default]
    Static,
    /// Headless rendering for JavaScript-built pages
    Dynamic,
}

/// When a rendered page counts as ready to extract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Readiness {
    /// Wait a fixed time after navigation
    FixedDelay { ms: u64 },

    /// Poll the document until it stops changing
    DomStable {
        poll_ms: u64,
        stable_polls: u32,
        max_wait_ms: u64,
    },

    /// Poll until a CSS selector matches
    Selector { css: String, max_wait_ms: u64 },
}

impl Default for Readiness {
    fn default() -> Self {
        Readiness::FixedDelay { ms: 1_000 }
    }
}

/// Rules applied by the normalizer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRules {
    /// Volatile regions stripped before hashing
    #[serde(default)]
    pub suppress: Vec<SuppressRule>,

    /// Named values pulled from the page
    #[serde(default)]
    pub fields: Vec<FieldRule>,
}

impl ExtractionRules {
    /// Whether changes to the named field force a `major` change.
    ///
    /// Fields no longer configured are not tracked.
    pub fn is_tracked(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name && f.tracked)
    }
}

/// A volatile-content suppression rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuppressRule {
    /// Replace regex matches on each canonical line
    Regex {
        pattern: String,
        #[serde(default)]
        replacement: String,
    },

    /// Drop every element matching a CSS selector, with its subtree
    Selector { css: String },
}

/// A named field extracted from the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub name: String,

    /// CSS selector; the first match is used
    pub selector: String,

    /// Read this attribute instead of the element text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr: Option<String>,

    /// Regex applied to the value; capture group 1 wins over the whole match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// A change to a tracked field is always `major`
    #[serde(default = "tracked_default")]
    pub tracked: bool,
}

fn tracked_default() -> bool {
    true
}

/// Serialize durations as whole seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A static target alerting on `major` through a single `log` channel.
    pub fn target(id: &str) -> Target {
        Target {
            id: id.to_string(),
            name: format!("Form {id}"),
            url: format!("https://example.gov/{id}"),
            agency: Some("Department of Labor".to_string()),
            render_mode: RenderMode::Static,
            readiness: Readiness::default(),
            extraction: ExtractionRules::default(),
            fetch_interval: Duration::from_secs(3600),
            significance_threshold: Significance::Major,
            channels: BTreeSet::from(["log".to_string()]),
            enabled: true,
        }
    }
}
