//! Content guard.
//!
//! Rejects a fetch whose canonical content collapsed compared to the
//! previous snapshot, such as a blank render or an error page served with
//! status 200. A collapse that persists for `accept_after` consecutive
//! cycles is accepted as the page's new state.

use crate::models::GuardConfig;

/// Result of a guard check.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardResult {
    /// Safe to proceed
    Safe {
        current_lines: usize,
        previous_lines: usize,
    },
    /// No previous snapshot, or one below the baseline size
    ColdStart { current_lines: usize },
    /// Content collapsed; the cycle is treated as a failed fetch
    Tripped {
        current_lines: usize,
        previous_lines: usize,
        drop_percent: f64,
    },
    /// Content collapsed again after enough trips; accepted as real
    Accepted {
        current_lines: usize,
        previous_lines: usize,
    },
}

impl GuardResult {
    pub fn allows_store(&self) -> bool {
        !matches!(self, GuardResult::Tripped { .. })
    }
}

/// Guard against storing collapsed content.
#[derive(Debug, Clone)]
pub struct ContentGuard {
    config: GuardConfig,
}

impl ContentGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    /// Check a new snapshot's line count against the previous one.
    ///
    /// `prior_trips` is the number of directly preceding cycles this guard
    /// already rejected for the same target.
    pub fn check(
        &self,
        current_lines: usize,
        previous_lines: Option<usize>,
        prior_trips: u32,
    ) -> GuardResult {
        let previous_lines = match previous_lines {
            Some(lines) if self.config.enabled && lines >= self.config.min_baseline_lines => lines,
            _ => return GuardResult::ColdStart { current_lines },
        };

        if current_lines < previous_lines {
            let drop = previous_lines - current_lines;
            let drop_percent = (drop as f64 / previous_lines as f64) * 100.0;

            if drop_percent > self.config.max_drop_percent as f64 {
                if prior_trips + 1 >= self.config.accept_after {
                    return GuardResult::Accepted {
                        current_lines,
                        previous_lines,
                    };
                }
                return GuardResult::Tripped {
                    current_lines,
                    previous_lines,
                    drop_percent,
                };
            }
        }

        GuardResult::Safe {
            current_lines,
            previous_lines,
        }
    }
}

impl Default for ContentGuard {
    fn default() -> Self {
        Self::new(GuardConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_no_drop() {
        let guard = ContentGuard::default();
        assert!(matches!(
            guard.check(100, Some(100), 0),
            GuardResult::Safe { .. }
        ));
    }

    #[test]
    fn test_safe_small_drop() {
        let guard = ContentGuard::default();
        assert!(matches!(
            guard.check(50, Some(100), 0),
            GuardResult::Safe { .. }
        ));
    }

    #[test]
    fn test_tripped_on_collapse() {
        let guard = ContentGuard::default();
        let result = guard.check(3, Some(100), 0);
        assert!(matches!(result, GuardResult::Tripped { .. }));
        assert!(!result.allows_store());
    }

    #[test]
    fn test_empty_page_trips() {
        let guard = ContentGuard::default();
        assert!(matches!(
            guard.check(0, Some(40), 0),
            GuardResult::Tripped { .. }
        ));
    }

    #[test]
    fn test_cold_start() {
        let guard = ContentGuard::default();
        assert!(matches!(
            guard.check(0, None, 0),
            GuardResult::ColdStart { .. }
        ));
        assert!(matches!(
            guard.check(0, Some(5), 0),
            GuardResult::ColdStart { .. }
        ));
    }

    #[test]
    fn test_persistent_collapse_accepted() {
        let guard = ContentGuard::default();
        assert!(matches!(
            guard.check(2, Some(100), 1),
            GuardResult::Tripped { .. }
        ));
        let result = guard.check(2, Some(100), 2);
        assert!(matches!(result, GuardResult::Accepted { .. }));
        assert!(result.allows_store());
    }

    #[test]
    fn test_disabled_guard() {
        let guard = ContentGuard::new(GuardConfig {
            enabled: false,
            ..GuardConfig::default()
        });
        assert!(guard.check(0, Some(100), 0).allows_store());
    }
}
