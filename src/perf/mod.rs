// SPDX-License-Identifier: MPL-2.0

//! Frame timing feedback.
//!
//! - [`rolling`]: fixed-capacity moving averages
//! - [`monitor`]: decode/render/total timings and drop counters
//! - [`skip`]: per-tick decode-or-repeat decision driven by the monitor

mod monitor;
mod rolling;
mod skip;

pub use monitor::{PerformanceMonitor, PerformanceReport};
pub use skip::{FrameSkipController, SkipMode};
