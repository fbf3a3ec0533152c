//! Service layer for the monitor.
//!
//! This module contains the components the pipeline talks to:
//! - Target registry (`TargetRegistry`)
//! - Content acquisition (`Fetcher`), with headless rendering (`RenderPool`)
//! - Notification channels (`Channel`, `ChannelRegistry`)

pub mod channels;
mod fetcher;
mod registry;
pub mod render;

pub use channels::{Channel, ChannelRegistry};
pub use fetcher::{Fetcher, RawContent};
pub use registry::TargetRegistry;
pub use render::{RenderError, RenderPool, Renderer};
