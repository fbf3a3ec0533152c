//! Monitoring pipeline.
//!
//! - `normalize` / `diff` / `classify` / `detect`: turn fetched pages into change records
//! - `guard`: reject collapsed content before it is stored
//! - `dispatch`: deliver alerts with per-channel retry and state tracking
//! - `cycle`: one fetch-detect-alert pass for one target
//! - `scheduler`: per-target timers, concurrency, and shutdown
//! - `status`: operator-visible target status

pub mod classify;
pub mod cycle;
pub mod detect;
pub mod diff;
pub mod dispatch;
pub mod guard;
pub mod normalize;
pub mod scheduler;
pub mod status;

pub use cycle::{CycleContext, CycleOutcome, run_cycle};
pub use detect::ChangeDetector;
pub use dispatch::{AlertDispatcher, DispatchReport};
pub use scheduler::Monitor;
pub use status::StatusBoard;
