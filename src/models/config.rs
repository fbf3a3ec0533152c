//! Application configuration structures.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::change::Significance;
use super::target::{ExtractionRules, FieldRule, Readiness, RenderMode, SuppressRule, Target};
use crate::error::{AppError, Result};
use crate::pipeline::normalize::Normalizer;
use crate::utils::retry::RetryPolicy;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Scheduler and storage settings
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// HTTP fetch behavior
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Remote rendering service for dynamic targets
    #[serde(default)]
    pub render: RenderConfig,

    /// Change classification settings
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Alert delivery settings
    #[serde(default)]
    pub alerts: AlertConfig,

    /// Values applied to targets that do not set them
    #[serde(default)]
    pub defaults: TargetDefaults,

    /// Notification channels
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    /// Monitored pages
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Resolve every target against the `[defaults]` section.
    pub fn resolved_targets(&self) -> Vec<Target> {
        self.targets
            .iter()
            .map(|t| t.resolve(&self.defaults))
            .collect()
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.monitor.max_concurrent == 0 {
            return Err(AppError::validation("monitor.max_concurrent must be > 0"));
        }
        if self.monitor.store_timeout_secs == 0 {
            return Err(AppError::validation(
                "monitor.store_timeout_secs must be > 0",
            ));
        }
        if self.fetch.user_agent.trim().is_empty() {
            return Err(AppError::validation("fetch.user_agent is empty"));
        }
        if self.fetch.timeout_secs == 0 {
            return Err(AppError::validation("fetch.timeout_secs must be > 0"));
        }
        self.fetch.retry.validate("fetch.retry")?;
        self.alerts.retry.validate("alerts.retry")?;
        if self.alerts.send_timeout_secs == 0 {
            return Err(AppError::validation("alerts.send_timeout_secs must be > 0"));
        }
        if self.render.pool_size == 0 {
            return Err(AppError::validation("render.pool_size must be > 0"));
        }
        self.detection.validate()?;

        let mut channel_names = HashSet::new();
        for channel in &self.channels {
            if !channel_names.insert(channel.name.as_str()) {
                return Err(AppError::validation(format!(
                    "duplicate channel name '{}'",
                    channel.name
                )));
            }
            channel.validate()?;
        }
        if let Some(operator) = &self.alerts.operator_channel {
            if !channel_names.contains(operator.as_str()) {
                return Err(AppError::validation(format!(
                    "alerts.operator_channel '{operator}' is not a configured channel"
                )));
            }
        }

        let mut target_ids = HashSet::new();
        for target in self.resolved_targets() {
            validate_target_id(&target.id)?;
            if !target_ids.insert(target.id.clone()) {
                return Err(AppError::validation(format!(
                    "duplicate target id '{}'",
                    target.id
                )));
            }

            let url = url::Url::parse(&target.url)?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(AppError::validation(format!(
                    "target '{}' url must be http(s)",
                    target.id
                )));
            }
            if target.fetch_interval.is_zero() {
                return Err(AppError::validation(format!(
                    "target '{}' fetch interval must be > 0",
                    target.id
                )));
            }
            if target.render_mode == RenderMode::Dynamic && self.render.endpoint.is_none() {
                return Err(AppError::validation(format!(
                    "target '{}' is dynamic but render.endpoint is not set",
                    target.id
                )));
            }
            for channel in &target.channels {
                if !channel_names.contains(channel.as_str()) {
                    return Err(AppError::validation(format!(
                        "target '{}' references unknown channel '{channel}'",
                        target.id
                    )));
                }
            }

            let mut field_names = HashSet::new();
            for field in &target.extraction.fields {
                if !field_names.insert(field.name.as_str()) {
                    return Err(AppError::validation(format!(
                        "target '{}' has duplicate field '{}'",
                        target.id, field.name
                    )));
                }
            }

            // Fails on invalid regex or CSS
            Normalizer::new(&target.extraction)?;
            if let Readiness::Selector { css, .. } = &target.readiness {
                scraper::Selector::parse(css)
                    .map_err(|e| AppError::selector(css.as_str(), format!("{e:?}")))?;
            }
        }

        Ok(())
    }
}

/// Target ids name storage directories.
fn validate_target_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AppError::validation(format!(
            "target id '{id}' must match [A-Za-z0-9_-]+"
        )))
    }
}

/// Scheduler and storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Directory holding history and status files
    #[serde(default = "defaults::storage_dir")]
    pub storage_dir: String,

    /// Maximum simultaneously running cycles
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,

    /// Upper bound for a history store operation
    #[serde(default = "defaults::store_timeout")]
    pub store_timeout_secs: u64,

    /// Time given to running cycles after a shutdown signal
    #[serde(default = "defaults::shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            storage_dir: defaults::storage_dir(),
            max_concurrent: defaults::max_concurrent(),
            store_timeout_secs: defaults::store_timeout(),
            shutdown_grace_secs: defaults::shutdown_grace(),
        }
    }
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    #[serde(default = "defaults::fetch_retry")]
    pub retry: RetryConfig,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            retry: defaults::fetch_retry(),
        }
    }
}

/// Bounded exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub base_delay_ms: u64,

    /// Cap on any single delay
    #[serde(default = "defaults::max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "defaults::multiplier")]
    pub multiplier: f64,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
        }
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(AppError::validation(format!(
                "{section}.max_attempts must be > 0"
            )));
        }
        if self.multiplier < 1.0 {
            return Err(AppError::validation(format!(
                "{section}.multiplier must be >= 1.0"
            )));
        }
        Ok(())
    }
}

/// Remote rendering service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Base URL of the rendering service; required for dynamic targets
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Access token appended as `?token=`
    #[serde(default)]
    pub token: Option<String>,

    /// Maximum simultaneously open sessions
    #[serde(default = "defaults::pool_size")]
    pub pool_size: usize,

    /// Upper bound for acquiring, navigating, and reading a session
    #[serde(default = "defaults::session_timeout")]
    pub session_timeout_secs: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            pool_size: defaults::pool_size(),
            session_timeout_secs: defaults::session_timeout(),
        }
    }
}

/// Which classifier grades diffs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    #[default]
    Rules,
    Scoring,
}

/// Change classification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(default)]
    pub classifier: ClassifierKind,

    /// Change ratio at or above which a diff is `minor`
    #[serde(default = "defaults::minor_ratio")]
    pub minor_ratio: f64,

    /// Change ratio at or above which a diff is `major`
    #[serde(default = "defaults::major_ratio")]
    pub major_ratio: f64,

    /// Added/removed lines kept in a change record for alert bodies
    #[serde(default = "defaults::sample_lines")]
    pub sample_lines: usize,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub guard: GuardConfig,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            classifier: ClassifierKind::default(),
            minor_ratio: defaults::minor_ratio(),
            major_ratio: defaults::major_ratio(),
            sample_lines: defaults::sample_lines(),
            scoring: ScoringConfig::default(),
            guard: GuardConfig::default(),
        }
    }
}

impl DetectionConfig {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.minor_ratio) || !(0.0..=1.0).contains(&self.major_ratio) {
            return Err(AppError::validation(
                "detection ratios must be within 0.0..=1.0",
            ));
        }
        if self.minor_ratio > self.major_ratio {
            return Err(AppError::validation(
                "detection.minor_ratio must not exceed detection.major_ratio",
            ));
        }
        if self.scoring.minor_cutoff > self.scoring.major_cutoff {
            return Err(AppError::validation(
                "detection.scoring.minor_cutoff must not exceed major_cutoff",
            ));
        }
        if self.guard.max_drop_percent > 100 {
            return Err(AppError::validation(
                "detection.guard.max_drop_percent must be <= 100",
            ));
        }
        Ok(())
    }
}

/// Weights for the scoring classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "defaults::ratio_weight")]
    pub ratio_weight: f64,
    #[serde(default = "defaults::volume_weight")]
    pub volume_weight: f64,
    #[serde(default = "defaults::keyword_weight")]
    pub keyword_weight: f64,
    #[serde(default = "defaults::minor_cutoff")]
    pub minor_cutoff: f64,
    #[serde(default = "defaults::major_cutoff")]
    pub major_cutoff: f64,
    /// Terms that make a changed line more significant (case-insensitive)
    #[serde(default = "defaults::keywords")]
    pub keywords: Vec<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            ratio_weight: defaults::ratio_weight(),
            volume_weight: defaults::volume_weight(),
            keyword_weight: defaults::keyword_weight(),
            minor_cutoff: defaults::minor_cutoff(),
            major_cutoff: defaults::major_cutoff(),
            keywords: defaults::keywords(),
        }
    }
}

/// Content guard: rejects snapshots whose content collapsed compared to the
/// previous one (blank renders, error pages served with 200).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "defaults::guard_enabled")]
    pub enabled: bool,

    /// Maximum allowed line-count drop (0-100)
    #[serde(default = "defaults::max_drop_percent")]
    pub max_drop_percent: u8,

    /// Previous snapshots shorter than this are not guarded
    #[serde(default = "defaults::min_baseline_lines")]
    pub min_baseline_lines: usize,

    /// Collapsed content seen this many cycles in a row is accepted
    #[serde(default = "defaults::accept_after")]
    pub accept_after: u32,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::guard_enabled(),
            max_drop_percent: defaults::max_drop_percent(),
            min_baseline_lines: defaults::min_baseline_lines(),
            accept_after: defaults::accept_after(),
        }
    }
}

/// Alert delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Upper bound for a single channel send
    #[serde(default = "defaults::send_timeout")]
    pub send_timeout_secs: u64,

    #[serde(default = "defaults::alert_retry")]
    pub retry: RetryConfig,

    /// Channel receiving reports of permanently failed deliveries
    #[serde(default)]
    pub operator_channel: Option<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: defaults::send_timeout(),
            retry: defaults::alert_retry(),
            operator_channel: None,
        }
    }
}

/// Check cadence, by name or in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FetchInterval {
    Named(Frequency),
    Seconds(u64),
}

impl FetchInterval {
    pub fn as_duration(&self) -> Duration {
        match self {
            FetchInterval::Named(frequency) => frequency.as_duration(),
            FetchInterval::Seconds(secs) => Duration::from_secs(*secs),
        }
    }
}

/// Named check frequencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    /// Four weeks
    Monthly,
}

impl Frequency {
    pub fn as_duration(&self) -> Duration {
        const HOUR: u64 = 60 * 60;
        let secs = match self {
            Frequency::Hourly => HOUR,
            Frequency::Daily => 24 * HOUR,
            Frequency::Weekly => 7 * 24 * HOUR,
            Frequency::Monthly => 28 * 24 * HOUR,
        };
        Duration::from_secs(secs)
    }
}

/// Defaults applied to every target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetDefaults {
    #[serde(default = "defaults::fetch_interval")]
    pub fetch_interval: FetchInterval,

    #[serde(default = "defaults::significance_threshold")]
    pub significance_threshold: Significance,

    /// Channels used by targets that list none
    #[serde(default)]
    pub channels: Vec<String>,

    /// Suppression rules prepended to every target's own rules
    #[serde(default)]
    pub suppress: Vec<SuppressRule>,

    #[serde(default)]
    pub readiness: Readiness,
}

impl Default for TargetDefaults {
    fn default() -> Self {
        Self {
            fetch_interval: defaults::fetch_interval(),
            significance_threshold: defaults::significance_threshold(),
            channels: Vec::new(),
            suppress: Vec::new(),
            readiness: Readiness::default(),
        }
    }
}

/// A target as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    pub url: String,

    #[serde(default)]
    pub agency: Option<String>,

    #[serde(default)]
    pub render_mode: RenderMode,

    #[serde(default)]
    pub readiness: Option<Readiness>,

    #[serde(default)]
    pub suppress: Vec<SuppressRule>,

    #[serde(default)]
    pub fields: Vec<FieldRule>,

    #[serde(default, alias = "check_frequency", alias = "interval_secs")]
    pub fetch_interval: Option<FetchInterval>,

    #[serde(default)]
    pub significance_threshold: Option<Significance>,

    #[serde(default)]
    pub channels: Vec<String>,

    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
}

impl TargetConfig {
    /// Resolve optional settings against the defaults.
    pub fn resolve(&self, defaults: &TargetDefaults) -> Target {
        let channels = if self.channels.is_empty() {
            &defaults.channels
        } else {
            &self.channels
        };

        let mut suppress = defaults.suppress.clone();
        suppress.extend(self.suppress.iter().cloned());

        Target {
            id: self.id.clone(),
            name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            url: self.url.clone(),
            agency: self.agency.clone(),
            render_mode: self.render_mode,
            readiness: self
                .readiness
                .clone()
                .unwrap_or_else(|| defaults.readiness.clone()),
            extraction: ExtractionRules {
                suppress,
                fields: self.fields.clone(),
            },
            fetch_interval: self
                .fetch_interval
                .unwrap_or(defaults.fetch_interval)
                .as_duration(),
            significance_threshold: self
                .significance_threshold
                .unwrap_or(defaults.significance_threshold),
            channels: channels.iter().cloned().collect::<BTreeSet<_>>(),
            enabled: self.enabled,
        }
    }
}

/// A notification channel definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Name referenced by targets
    pub name: String,

    #[serde(flatten)]
    pub kind: ChannelKind,
}

impl ChannelConfig {
    fn validate(&self) -> Result<()> {
        let ChannelKind::Email { smtp_host, from, to, username, password, .. } = &self.kind
        else {
            return Ok(());
        };
        if smtp_host.is_empty() {
            return Err(AppError::validation(format!(
                "channel '{}': smtp_host must not be empty",
                self.name
            )));
        }
        if to.is_empty() {
            return Err(AppError::validation(format!(
                "channel '{}': at least one recipient is required",
                self.name
            )));
        }
        if username.is_some() != password.is_some() {
            return Err(AppError::validation(format!(
                "channel '{}': username and password must be set together",
                self.name
            )));
        }
        for address in std::iter::once(from).chain(to) {
            address.parse::<lettre::message::Mailbox>().map_err(|e| {
                AppError::validation(format!(
                    "channel '{}': invalid address '{address}': {e}",
                    self.name
                ))
            })?;
        }
        Ok(())
    }
}

/// Supported channel transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelKind {
    /// Generic JSON POST of the alert message
    Webhook {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Slack incoming webhook
    Slack { webhook_url: String },
    /// Microsoft Teams incoming webhook (MessageCard)
    Teams { webhook_url: String },
    /// SMTP mail with plain text and HTML parts
    Email {
        smtp_host: String,
        #[serde(default = "defaults::smtp_port")]
        port: u16,
        /// STARTTLS upgrade; off only for local relays
        #[serde(default = "defaults::starttls")]
        starttls: bool,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        from: String,
        to: Vec<String>,
    },
    /// Write alerts to the log
    Log,
}

mod defaults {
    use super::{FetchInterval, Frequency, RetryConfig, Significance};

    // Monitor defaults
    pub fn storage_dir() -> String {
        "storage".into()
    }
    pub fn max_concurrent() -> usize {
        4
    }
    pub fn store_timeout() -> u64 {
        30
    }
    pub fn shutdown_grace() -> u64 {
        30
    }

    // Fetch defaults
    pub fn user_agent() -> String {
        "PayrollMonitor/1.0 (Government Forms Monitoring)".into()
    }
    pub fn timeout() -> u64 {
        30
    }
    pub fn fetch_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: max_delay(),
            multiplier: multiplier(),
        }
    }
    pub fn max_delay() -> u64 {
        30_000
    }
    pub fn multiplier() -> f64 {
        2.0
    }

    // Render defaults
    pub fn pool_size() -> usize {
        2
    }
    pub fn session_timeout() -> u64 {
        60
    }

    // Detection defaults
    pub fn minor_ratio() -> f64 {
        0.01
    }
    pub fn major_ratio() -> f64 {
        0.25
    }
    pub fn sample_lines() -> usize {
        10
    }
    pub fn ratio_weight() -> f64 {
        4.0
    }
    pub fn volume_weight() -> f64 {
        0.5
    }
    pub fn keyword_weight() -> f64 {
        1.0
    }
    pub fn minor_cutoff() -> f64 {
        0.5
    }
    pub fn major_cutoff() -> f64 {
        3.0
    }
    pub fn keywords() -> Vec<String> {
        [
            "wage",
            "rate",
            "effective",
            "deadline",
            "revision",
            "rev.",
            "form",
            "fringe",
            "overtime",
            "withholding",
            "penalty",
            "required",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
    pub fn guard_enabled() -> bool {
        true
    }
    pub fn max_drop_percent() -> u8 {
        80
    }
    pub fn min_baseline_lines() -> usize {
        20
    }
    pub fn accept_after() -> u32 {
        3
    }

    // Alert defaults
    pub fn send_timeout() -> u64 {
        15
    }
    pub fn alert_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            multiplier: multiplier(),
        }
    }

    // Target defaults
    pub fn fetch_interval() -> FetchInterval {
        FetchInterval::Named(Frequency::Weekly)
    }
    pub fn significance_threshold() -> Significance {
        Significance::Major
    }
    pub fn enabled() -> bool {
        true
    }

    // Email defaults
    pub fn smtp_port() -> u16 {
        587
    }
    pub fn starttls() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[monitor]
max_concurrent = 2

[defaults]
fetch_interval = "daily"
channels = ["ops-log"]

[[defaults.suppress]]
kind = "regex"
pattern = "Last updated: .*"

[[channels]]
name = "ops-log"
kind = "log"

[[channels]]
name = "payroll-slack"
kind = "slack"
webhook_url = "https://hooks.slack.com/services/T000/B000/XXX"

[[targets]]
id = "wh-347"
name = "WH-347"
url = "https://www.dol.gov/agencies/whd/forms/wh347"
agency = "U.S. Department of Labor"
check_frequency = "weekly"
channels = ["payroll-slack"]

[[targets.fields]]
name = "revision"
selector = ".form-revision"

[[targets]]
id = "ca-dir"
url = "https://www.dir.ca.gov/dlsr/pwd/"
fetch_interval = 7200
significance_threshold = "minor"
"#;

    #[test]
    fn validate_default_config_ok() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn parses_and_resolves_targets() {
        let config = Config::parse(SAMPLE).unwrap();
        config.validate().unwrap();

        let targets = config.resolved_targets();
        assert_eq!(targets.len(), 2);

        let wh = &targets[0];
        assert_eq!(wh.fetch_interval, Frequency::Weekly.as_duration());
        assert_eq!(wh.significance_threshold, Significance::Major);
        assert!(wh.channels.contains("payroll-slack"));
        assert_eq!(wh.extraction.suppress.len(), 1);
        assert_eq!(wh.extraction.fields[0].name, "revision");

        let ca = &targets[1];
        assert_eq!(ca.name, "ca-dir");
        assert_eq!(ca.fetch_interval, Duration::from_secs(7200));
        assert_eq!(ca.significance_threshold, Significance::Minor);
        assert!(ca.channels.contains("ops-log"));
    }

    #[test]
    fn parses_channel_kinds() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.channels[0].kind, ChannelKind::Log);
        assert!(matches!(
            config.channels[1].kind,
            ChannelKind::Slack { .. }
        ));
    }

    #[test]
    fn parses_and_validates_email_channel() {
        let mut config = Config::parse(
            r#"
[[channels]]
name = "payroll-mail"
kind = "email"
smtp_host = "smtp.example.gov"
from = "Payroll Monitor <monitor@example.gov>"
to = ["payroll@example.gov"]
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(
            config.channels[0].kind,
            ChannelKind::Email {
                smtp_host: "smtp.example.gov".into(),
                port: 587,
                starttls: true,
                username: None,
                password: None,
                from: "Payroll Monitor <monitor@example.gov>".into(),
                to: vec!["payroll@example.gov".into()],
            }
        );

        if let ChannelKind::Email { to, .. } = &mut config.channels[0].kind {
            to[0] = "not an address".into();
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_channel() {
        let mut config = Config::parse(SAMPLE).unwrap();
        config.targets[0].channels = vec!["pager".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_target_id() {
        let mut config = Config::parse(SAMPLE).unwrap();
        config.targets[0].id = "../etc".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_target() {
        let mut config = Config::parse(SAMPLE).unwrap();
        config.targets[1].id = "wh-347".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_dynamic_without_renderer() {
        let mut config = Config::parse(SAMPLE).unwrap();
        config.targets[0].render_mode = RenderMode::Dynamic;
        assert!(config.validate().is_err());

        config.render.endpoint = Some("http://localhost:3000".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_invalid_rules() {
        let mut config = Config::parse(SAMPLE).unwrap();
        config.targets[0].suppress.push(SuppressRule::Regex {
            pattern: "(unclosed".into(),
            replacement: String::new(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.monitor.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_ratios() {
        let mut config = Config::default();
        config.detection.minor_ratio = 0.5;
        config.detection.major_ratio = 0.1;
        assert!(config.validate().is_err());
    }
}
