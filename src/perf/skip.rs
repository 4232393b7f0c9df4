// SPDX-License-Identifier: MPL-2.0

//! Decode-or-repeat decision with hysteresis.
//!
//! The controller compares the rolling average decode time from a
//! [`PerformanceReport`] against two thresholds. It enters [`SkipMode::Skipping`]
//! after `streak` consecutive reports above `slow` and only leaves it after
//! `streak` consecutive reports below `good`. While skipping it decodes one
//! tick out of `skip_interval`.

use std::time::Duration;

use tracing::{info, warn};

use super::monitor::PerformanceReport;

pub const DEFAULT_SLOW: Duration = Duration::from_millis(30);
pub const DEFAULT_GOOD: Duration = Duration::from_millis(20);
pub const DEFAULT_STREAK: u32 = 3;
pub const DEFAULT_SKIP_INTERVAL: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipMode {
    /// Decode on every tick.
    Normal,
    /// Decode on one tick out of `skip_interval`.
    Skipping,
}

#[derive(Debug, Clone)]
pub struct FrameSkipController {
    mode: SkipMode,
    slow: Duration,
    good: Duration,
    streak: u32,
    required_streak: u32,
    skip_interval: u32,
    /// Ticks seen since entering `Skipping`.
    skip_ticks: u32,
}

impl FrameSkipController {
    pub fn new(slow: Duration, good: Duration, required_streak: u32, skip_interval: u32) -> Self {
        let mut controller = Self {
            mode: SkipMode::Normal,
            slow: DEFAULT_SLOW,
            good: DEFAULT_GOOD,
            streak: 0,
            required_streak: required_streak.max(1),
            skip_interval: skip_interval.max(2),
            skip_ticks: 0,
        };
        controller.set_thresholds(slow, good);
        controller
    }

    pub fn from_settings(settings: &loopframe_config::FrameSkipSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.slow_ms),
            Duration::from_millis(settings.good_ms),
            settings.streak,
            settings.skip_interval,
        )
    }

    #[must_use]
    pub fn mode(&self) -> SkipMode {
        self.mode
    }

    #[must_use]
    pub fn thresholds(&self) -> (Duration, Duration) {
        (self.slow, self.good)
    }

    /// Decide whether this tick should decode a new frame.
    pub fn should_decode(&mut self, report: &PerformanceReport) -> bool {
        if report.decode_samples > 0 {
            self.observe(report.avg_decode);
        }

        match self.mode {
            SkipMode::Normal => true,
            SkipMode::Skipping => {
                let decode = self.skip_ticks % self.skip_interval == 0;
                self.skip_ticks = self.skip_ticks.wrapping_add(1);
                decode
            }
        }
    }

    fn observe(&mut self, avg_decode: Duration) {
        let crossing = match self.mode {
            SkipMode::Normal => avg_decode > self.slow,
            SkipMode::Skipping => avg_decode < self.good,
        };

        if !crossing {
            self.streak = 0;
            return;
        }

        self.streak += 1;
        if self.streak < self.required_streak {
            return;
        }

        self.streak = 0;
        self.mode = match self.mode {
            SkipMode::Normal => {
                info!(
                    avg_decode_ms = avg_decode.as_millis(),
                    slow_ms = self.slow.as_millis(),
                    "Decode falling behind, skipping frames"
                );
                self.skip_ticks = 0;
                SkipMode::Skipping
            }
            SkipMode::Skipping => {
                info!(
                    avg_decode_ms = avg_decode.as_millis(),
                    good_ms = self.good.as_millis(),
                    "Decode recovered, resuming full frame rate"
                );
                SkipMode::Normal
            }
        };
    }

    /// Forget the current mode, e.g. when a new source starts.
    pub fn reset(&mut self) {
        self.mode = SkipMode::Normal;
        self.streak = 0;
        self.skip_ticks = 0;
    }

    /// Replace both thresholds. `good` must be strictly below `slow`, otherwise
    /// the call is ignored.
    pub fn set_thresholds(&mut self, slow: Duration, good: Duration) {
        if good >= slow {
            warn!(
                slow_ms = slow.as_millis(),
                good_ms = good.as_millis(),
                "Ignoring frame skip thresholds: good must be below slow"
            );
            return;
        }
        self.slow = slow;
        self.good = good;
    }
}

impl Default for FrameSkipController {
    fn default() -> Self {
        Self::new(
            DEFAULT_SLOW,
            DEFAULT_GOOD,
            DEFAULT_STREAK,
            DEFAULT_SKIP_INTERVAL,
        )
    }
}
