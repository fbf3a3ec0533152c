//! Pagewatch CLI
//!
//! Local entry point for running the monitor and inspecting its history.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use pagewatch::{
    error::{AppError, Result},
    models::{
        AlertMessage, ChangeId, ChangeRecord, Config, DiffSummary, ExtractionRules, Frequency,
        Readiness, RenderMode, Significance, SnapshotId, Target,
    },
    pipeline::{CycleOutcome, Monitor},
    services::ChannelRegistry,
    storage::{HistoryStore, LocalHistoryStore},
    utils::{http, log as report},
};

/// Pagewatch - Payroll and Regulatory Page Monitor
#[derive(Parser, Debug)]
#[command(
    name = "pagewatch",
    version,
    about = "Monitors payroll and regulatory web pages for changes"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the scheduler and run until Ctrl-C
    Run,

    /// Run one cycle immediately
    Check {
        /// Target to check (repeatable; default: all enabled targets)
        #[arg(long = "target")]
        targets: Vec<String>,
    },

    /// Validate the configuration file
    Validate,

    /// Show per-target status
    Status,

    /// List stored snapshots and changes of a target
    History {
        #[arg(long)]
        target: String,

        /// Start of the time range (RFC 3339, inclusive)
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// End of the time range (RFC 3339, exclusive)
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },

    /// Send a synthetic alert through the configured channels
    TestNotify {
        /// Channel to test (default: all)
        #[arg(long)]
        channel: Option<String>,
    },
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load(path).map_err(|e| {
        log::error!("Failed to load {}: {}", path.display(), e);
        e
    })?;
    config.validate()?;
    log::info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Run => {
            let monitor = Arc::new(Monitor::from_config(&config).await?);

            let signal = {
                let monitor = Arc::clone(&monitor);
                tokio::spawn(async move {
                    match tokio::signal::ctrl_c().await {
                        Ok(()) => log::info!("Interrupt received; shutting down"),
                        Err(e) => log::error!("Failed to listen for Ctrl-C: {}", e),
                    }
                    monitor.shutdown();
                })
            };

            monitor.run().await?;
            signal.abort();
        }

        Command::Check { targets } => {
            let monitor = Monitor::from_config(&config).await?;
            let outcomes = monitor.run_once(&targets).await?;

            report::header("Check results");
            let mut changed = 0;
            let mut failed = 0;
            for (target_id, outcome) in &outcomes {
                match outcome {
                    CycleOutcome::Changed { change, report: delivery } => {
                        changed += 1;
                        report::line(&format!(
                            "{}: {} change ({})",
                            target_id,
                            change.significance,
                            change.diff_summary.describe()
                        ));
                        if let Some(delivery) = delivery {
                            for failure in &delivery.failures {
                                report::sub_item(&format!(
                                    "alert failed on {}: {}",
                                    failure.channel, failure.error
                                ));
                            }
                        }
                    }
                    CycleOutcome::Failed(kind) => {
                        failed += 1;
                        report::line(&format!("{}: failed ({})", target_id, kind.reason()));
                    }
                    other => report::line(&format!("{}: {}", target_id, other.label())),
                }
            }
            report::summary(
                "Check",
                &[
                    ("Targets", outcomes.len().to_string()),
                    ("Changed", changed.to_string()),
                    ("Failed", failed.to_string()),
                ],
            );
        }

        Command::Validate => {
            log::info!(
                "Config OK: {} target(s), {} channel(s)",
                config.targets.len(),
                config.channels.len()
            );
        }

        Command::Status => {
            let store = LocalHistoryStore::new(&config.monitor.storage_dir);
            let statuses = store.load_status().await.map_err(AppError::from)?;

            report::header("Target status");
            for target in config.resolved_targets() {
                let status = statuses.get(&target.id).cloned().unwrap_or_default();
                let flag = if status.needs_attention {
                    " [needs attention]"
                } else if !target.enabled {
                    " [disabled]"
                } else {
                    ""
                };
                report::line(&format!("{} ({}){}", target.name, target.id, flag));
                report::sub_item(&format!(
                    "last success: {}",
                    format_time(status.last_success_at)
                ));
                report::sub_item(&format!(
                    "last failure: {}",
                    format_time(status.last_failure_at)
                ));
                if let Some(error) = &status.last_error {
                    report::sub_item(&format!("last error: {} ({})", error.kind, error.reason));
                }
                if status.consecutive_failures > 0 {
                    report::sub_item(&format!(
                        "consecutive failures: {}",
                        status.consecutive_failures
                    ));
                }
            }
            report::separator();
        }

        Command::History {
            target,
            since,
            until,
        } => {
            if !config.targets.iter().any(|t| t.id == target) {
                return Err(AppError::TargetNotFound(target));
            }
            let store = LocalHistoryStore::new(&config.monitor.storage_dir);
            let from = since.unwrap_or(DateTime::<Utc>::MIN_UTC);
            let to = until.unwrap_or(DateTime::<Utc>::MAX_UTC);

            report::header(&format!("History of {target}"));
            let mut snapshots = store.range(&target, from, to).await?;
            let mut count = 0;
            while let Some(snapshot) = snapshots.next().await {
                let snapshot = snapshot?;
                count += 1;
                report::line(&format!(
                    "{} {} {} ({} lines)",
                    snapshot.id,
                    snapshot.fetched_at.to_rfc3339(),
                    snapshot.short_hash(),
                    snapshot.canonical_content.lines().count()
                ));
            }

            let changes = store.changes(&target, from, to).await?;
            report::separator();
            for change in &changes {
                report::line(&format!(
                    "{} {} {}",
                    change.id,
                    change.significance,
                    change.detected_at.to_rfc3339()
                ));
                report::sub_item(&change.diff_summary.describe());
            }

            let alerts = store.alerts(&target).await?;
            for alert in &alerts {
                report::sub_item(&format!(
                    "alert {} on {}: {:?} after {} attempt(s)",
                    alert.change_id, alert.channel, alert.status, alert.attempts
                ));
            }

            report::summary(
                "History",
                &[
                    ("Snapshots", count.to_string()),
                    ("Changes", changes.len().to_string()),
                    ("Alert deliveries", alerts.len().to_string()),
                ],
            );
        }

        Command::TestNotify { channel } => {
            let client = http::create_async_client(&config.fetch)?;
            let registry = ChannelRegistry::from_config(&config.channels, &client);
            let names: Vec<String> = match channel {
                Some(name) if registry.get(&name).is_some() => vec![name],
                Some(name) => {
                    return Err(AppError::config(format!("unknown channel '{name}'")));
                }
                None => registry.names().map(str::to_string).collect(),
            };

            let message = test_message();
            let mut failures = 0;
            for name in &names {
                let Some(channel) = registry.get(name) else {
                    continue;
                };
                match channel.send(&message).await {
                    Ok(()) => report::line(&format!("{name}: delivered")),
                    Err(e) => {
                        failures += 1;
                        report::line(&format!("{name}: {e}"));
                    }
                }
            }
            if failures > 0 {
                return Err(AppError::config(format!(
                    "{failures} of {} channel(s) failed",
                    names.len()
                )));
            }
        }
    }

    Ok(())
}

fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}

/// Synthetic alert used by `test-notify`.
fn test_message() -> AlertMessage {
    let target = Target {
        id: "test-form-001".to_string(),
        name: "TEST-FORM-001".to_string(),
        url: "http://example.com/test-form".to_string(),
        agency: Some("Test Agency".to_string()),
        render_mode: RenderMode::Static,
        readiness: Readiness::default(),
        extraction: ExtractionRules::default(),
        fetch_interval: Frequency::Weekly.as_duration(),
        significance_threshold: Significance::Minor,
        channels: BTreeSet::new(),
        enabled: true,
    };

    let change = ChangeRecord {
        id: ChangeId {
            target_id: target.id.clone(),
            seq: 2,
        },
        from_snapshot: SnapshotId::new(target.id.clone(), 1),
        to_snapshot: SnapshotId::new(target.id.clone(), 2),
        diff_summary: DiffSummary::default(),
        significance: Significance::Minor,
        detected_at: Utc::now(),
    };

    let mut message = AlertMessage::for_change(&target, &change);
    message.summary = "This is a test notification from Pagewatch.".to_string();
    message
}
