// SPDX-License-Identifier: MPL-2.0

//! Per-tick composition of prefetching, frame skipping, playback and drawing.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::{
    perf::{FrameSkipController, PerformanceMonitor, PerformanceReport},
    player::Advance,
    prefetch::PrefetchOrchestrator,
    surface::Surface,
};

/// Ticks between two statistics log lines.
const DEFAULT_STATS_INTERVAL: u64 = 600;

pub struct Engine<S> {
    orchestrator: PrefetchOrchestrator,
    skip: FrameSkipController,
    monitor: PerformanceMonitor,
    surface: S,
    /// Generation of the item whose frames are on the surface.
    shown: u64,
    ticks: u64,
    stats_interval: u64,
}

impl<S: Surface> Engine<S> {
    pub fn new(orchestrator: PrefetchOrchestrator, skip: FrameSkipController, surface: S) -> Self {
        Self {
            orchestrator,
            skip,
            monitor: PerformanceMonitor::default(),
            surface,
            shown: 0,
            ticks: 0,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }

    /// Log playback statistics every `ticks` ticks. Zero disables the log.
    #[must_use]
    pub fn with_stats_interval(mut self, ticks: u64) -> Self {
        self.stats_interval = ticks;
        self
    }

    /// Run one display tick.
    ///
    /// # Errors
    ///
    /// Fails only when the surface cannot be written. Per-item failures are
    /// handled by moving on to the next item.
    pub fn tick(&mut self, now: Instant) -> eyre::Result<()> {
        let tick_started = Instant::now();
        self.ticks += 1;

        self.orchestrator.poll(now);
        let mut redraw = self.sync_generation();

        if self.orchestrator.player().is_some() {
            let report = self.monitor.report();
            if self.skip.should_decode(&report) {
                redraw |= self.advance(now);
            } else {
                self.monitor.record_frame_dropped();
            }
        }
        redraw |= self.sync_generation();

        if redraw {
            if let Some(player) = self.orchestrator.player() {
                let render_started = Instant::now();
                player.draw(&mut self.surface)?;
                self.monitor.record_frame_render(render_started.elapsed());
            }
        }

        if let Some(why) = self.orchestrator.take_last_error() {
            debug!(%why, "Orchestrator reported an error this tick");
        }

        self.monitor.record_total_frame_time(tick_started.elapsed());

        if self.stats_interval > 0 && self.ticks % self.stats_interval == 0 {
            self.log_stats();
        }
        Ok(())
    }

    /// Advance the current player. Returns whether a new frame is due on screen.
    fn advance(&mut self, now: Instant) -> bool {
        let Some(player) = self.orchestrator.player_mut() else {
            return false;
        };

        let decode_started = Instant::now();
        let step = player.advance(now);
        let decode_time = decode_started.elapsed();
        if let Some(why) = player.take_last_error() {
            debug!(%why, "Decoder restarted after an error");
        }

        match step {
            Ok(Advance::Presented { steps }) => {
                let per_frame = decode_time / u32::try_from(steps.max(1)).unwrap_or(u32::MAX);
                self.monitor.record_frame_decode(per_frame);
                true
            }
            Ok(Advance::Idle | Advance::Restarted) => false,
            Ok(Advance::Ended) => {
                self.orchestrator.next_video(now);
                false
            }
            Err(why) => {
                self.orchestrator.playback_failed(why, now);
                false
            }
        }
    }

    /// Reset frame timing state when a different item started playing.
    /// Returns whether that happened.
    fn sync_generation(&mut self) -> bool {
        let generation = self.orchestrator.generation();
        if generation == self.shown {
            return false;
        }

        self.shown = generation;
        self.skip.reset();
        self.monitor.reset();
        if let Some(player) = self.orchestrator.player() {
            info!(
                path = %player.path().display(),
                fps = player.fps(),
                rate = player.rate(),
                "Now playing"
            );
        }
        true
    }

    fn log_stats(&self) {
        let report = self.monitor.report();
        let Some(player) = self.orchestrator.player() else {
            info!(
                ticks = self.ticks,
                fetching = self.orchestrator.fetch_in_flight(),
                "Waiting for media"
            );
            return;
        };

        info!(
            ticks = self.ticks,
            path = %player.path().display(),
            frames = player.steps_taken(),
            restarts = player.restarts(),
            skip = ?self.skip.mode(),
            avg_decode_ms = ms(report.avg_decode),
            avg_render_ms = ms(report.avg_render),
            avg_total_ms = ms(report.avg_total),
            drop_rate = report.drop_rate,
            healthy = report.is_healthy,
            degrading = report.is_degrading,
            buffered = self.orchestrator.buffer().len(),
            "Video playback progress"
        );
    }

    #[must_use]
    pub fn report(&self) -> PerformanceReport {
        self.monitor.report()
    }

    #[must_use]
    pub fn orchestrator(&self) -> &PrefetchOrchestrator {
        &self.orchestrator
    }

    pub fn orchestrator_mut(&mut self) -> &mut PrefetchOrchestrator {
        &mut self.orchestrator
    }

    #[must_use]
    pub fn skip(&self) -> &FrameSkipController {
        &self.skip
    }

    #[must_use]
    pub fn surface(&self) -> &S {
        &self.surface
    }
}

fn ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
