// src/services/registry.rs

//! Target registry.
//!
//! Holds the current set of monitored targets. Readers get an immutable
//! snapshot of the whole set; a reload validates the new set first and
//! then swaps it in one step, so no reader ever sees a partial set.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{AppError, Result};
use crate::models::{Config, Target};
use crate::pipeline::normalize::Normalizer;

/// Shared, atomically replaceable set of targets.
#[derive(Clone)]
pub struct TargetRegistry {
    targets: Arc<watch::Sender<Arc<[Target]>>>,
}

impl TargetRegistry {
    /// Create a registry from resolved targets.
    pub fn new(targets: Vec<Target>) -> Result<Self> {
        validate_set(&targets)?;
        let (sender, _) = watch::channel(Arc::from(targets));
        Ok(Self {
            targets: Arc::new(sender),
        })
    }

    /// Build the registry from `[[targets]]`, with defaults applied.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.resolved_targets())
    }

    /// Current target set, in configuration order.
    pub fn list(&self) -> Arc<[Target]> {
        Arc::clone(&self.targets.borrow())
    }

    /// Look up one target.
    pub fn get(&self, id: &str) -> Result<Target> {
        self.targets
            .borrow()
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| AppError::TargetNotFound(id.to_string()))
    }

    /// Replace the whole target set.
    ///
    /// The new set is validated before anything changes; on error the
    /// current set stays in place.
    pub fn reload(&self, targets: Vec<Target>) -> Result<()> {
        validate_set(&targets)?;
        let count = targets.len();
        self.targets.send_replace(Arc::from(targets));
        log::info!("Target registry reloaded ({} targets)", count);
        Ok(())
    }

    /// Enable or disable a target without touching its history.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut found = false;
        self.targets.send_if_modified(|current| {
            let Some(index) = current.iter().position(|t| t.id == id) else {
                return false;
            };
            found = true;
            if current[index].enabled == enabled {
                return false;
            }

            let mut next = current.to_vec();
            next[index].enabled = enabled;
            *current = Arc::from(next);
            true
        });

        if !found {
            return Err(AppError::TargetNotFound(id.to_string()));
        }
        log::info!(
            "Target {} {}",
            id,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Receiver notified on every change to the target set.
    pub fn subscribe(&self) -> watch::Receiver<Arc<[Target]>> {
        self.targets.subscribe()
    }
}

/// Checks that hold for any target set, independent of the config file.
fn validate_set(targets: &[Target]) -> Result<()> {
    let mut seen = HashSet::new();
    for target in targets {
        if !seen.insert(target.id.as_str()) {
            return Err(AppError::validation(format!(
                "duplicate target id '{}'",
                target.id
            )));
        }
        if target.fetch_interval.is_zero() {
            return Err(AppError::validation(format!(
                "target '{}' fetch interval must be > 0",
                target.id
            )));
        }
        Normalizer::new(&target.extraction)?;
    }
    Ok(())
}
