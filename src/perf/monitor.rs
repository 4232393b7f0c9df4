// SPDX-License-Identifier: MPL-2.0

//! Aggregated frame timing health.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::rolling::{DEFAULT_WINDOW, RollingWindow};

/// Drop rate below which playback counts as healthy.
const HEALTHY_DROP_RATE: f64 = 0.01;
/// Drop rate above which playback counts as degrading.
const DEGRADING_DROP_RATE: f64 = 0.05;
/// 30 fps frame budget.
const HEALTHY_TOTAL_MS: f64 = 33.0;
const DEGRADING_DECODE_MS: f64 = 30.0;
const DEGRADING_TOTAL_MS: f64 = 40.0;

/// Point-in-time view of playback performance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceReport {
    pub avg_decode: Duration,
    pub avg_render: Duration,
    pub avg_total: Duration,
    /// Number of decode samples behind `avg_decode`.
    pub decode_samples: usize,
    pub dropped_frames: u64,
    pub total_frames: u64,
    /// Fraction of ticks that re-presented a frame instead of decoding.
    pub drop_rate: f64,
    pub is_healthy: bool,
    pub is_degrading: bool,
    pub uptime: Duration,
}

impl PerformanceReport {
    fn evaluate(
        avg_decode: Duration,
        avg_render: Duration,
        avg_total: Duration,
        decode_samples: usize,
        dropped_frames: u64,
        total_frames: u64,
        uptime: Duration,
    ) -> Self {
        let drop_rate = if total_frames == 0 {
            0.0
        } else {
            dropped_frames as f64 / total_frames as f64
        };
        let decode_ms = avg_decode.as_secs_f64() * 1000.0;
        let total_ms = avg_total.as_secs_f64() * 1000.0;

        Self {
            avg_decode,
            avg_render,
            avg_total,
            decode_samples,
            dropped_frames,
            total_frames,
            drop_rate,
            is_healthy: drop_rate < HEALTHY_DROP_RATE && total_ms < HEALTHY_TOTAL_MS,
            is_degrading: drop_rate > DEGRADING_DROP_RATE
                || decode_ms > DEGRADING_DECODE_MS
                || total_ms > DEGRADING_TOTAL_MS,
            uptime,
        }
    }
}

/// Rolling decode/render/total timings plus drop counters.
#[derive(Debug)]
pub struct PerformanceMonitor {
    decode: RollingWindow,
    render: RollingWindow,
    total: RollingWindow,
    dropped_frames: AtomicU64,
    total_frames: AtomicU64,
    started: Mutex<Instant>,
}

impl PerformanceMonitor {
    pub fn new(window: usize) -> Self {
        Self {
            decode: RollingWindow::new(window),
            render: RollingWindow::new(window),
            total: RollingWindow::new(window),
            dropped_frames: AtomicU64::new(0),
            total_frames: AtomicU64::new(0),
            started: Mutex::new(Instant::now()),
        }
    }

    pub fn record_frame_decode(&self, elapsed: Duration) {
        self.decode.add(elapsed);
    }

    pub fn record_frame_render(&self, elapsed: Duration) {
        self.render.add(elapsed);
    }

    /// Record the full cost of one tick. Every tick counts towards `total_frames`.
    pub fn record_total_frame_time(&self, elapsed: Duration) {
        self.total.add(elapsed);
        self.total_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_dropped(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn report(&self) -> PerformanceReport {
        let uptime = self
            .started
            .lock()
            .map(|started| started.elapsed())
            .unwrap_or_default();

        PerformanceReport::evaluate(
            self.decode.average(),
            self.render.average(),
            self.total.average(),
            self.decode.count(),
            self.dropped_frames.load(Ordering::Relaxed),
            self.total_frames.load(Ordering::Relaxed),
            uptime,
        )
    }

    pub fn reset(&self) {
        self.decode.reset();
        self.render.reset();
        self.total.reset();
        self.dropped_frames.store(0, Ordering::Relaxed);
        self.total_frames.store(0, Ordering::Relaxed);
        if let Ok(mut started) = self.started.lock() {
            *started = Instant::now();
        }
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn run_ticks(monitor: &PerformanceMonitor, ticks: u64, dropped: u64, total: Duration) {
        for i in 0..ticks {
            if i < dropped {
                monitor.record_frame_dropped();
            } else {
                monitor.record_frame_decode(ms(5));
            }
            monitor.record_frame_render(ms(2));
            monitor.record_total_frame_time(total);
        }
    }

    #[test]
    fn fresh_monitor_reports_nothing_dropped() {
        let report = PerformanceMonitor::default().report();
        assert_eq!(report.total_frames, 0);
        assert_eq!(report.drop_rate, 0.0);
        assert_eq!(report.avg_decode, Duration::ZERO);
        assert!(report.is_healthy);
        assert!(!report.is_degrading);
    }

    #[test]
    fn smooth_playback_is_healthy() {
        let monitor = PerformanceMonitor::new(200);
        run_ticks(&monitor, 200, 1, ms(16));

        let report = monitor.report();
        assert_eq!(report.total_frames, 200);
        assert_eq!(report.dropped_frames, 1);
        assert!((report.drop_rate - 0.005).abs() < 1e-9);
        assert!(report.is_healthy);
        assert!(!report.is_degrading);
    }

    #[test]
    fn heavy_dropping_is_degrading() {
        let monitor = PerformanceMonitor::new(100);
        run_ticks(&monitor, 100, 6, ms(16));

        let report = monitor.report();
        assert!(report.drop_rate > 0.05);
        assert!(!report.is_healthy);
        assert!(report.is_degrading);
    }

    #[test]
    fn slow_decode_is_degrading_without_drops() {
        let monitor = PerformanceMonitor::new(10);
        for _ in 0..10 {
            monitor.record_frame_decode(ms(31));
            monitor.record_total_frame_time(ms(32));
        }

        let report = monitor.report();
        assert_eq!(report.drop_rate, 0.0);
        assert!(report.is_healthy);
        assert!(report.is_degrading);
    }

    #[test]
    fn long_ticks_are_neither_healthy_nor_stable() {
        let monitor = PerformanceMonitor::new(10);
        run_ticks(&monitor, 10, 0, ms(41));

        let report = monitor.report();
        assert!(!report.is_healthy);
        assert!(report.is_degrading);
    }

    #[test]
    fn reset_clears_counters_and_windows() {
        let monitor = PerformanceMonitor::new(10);
        run_ticks(&monitor, 10, 5, ms(50));
        monitor.reset();

        let report = monitor.report();
        assert_eq!(report.total_frames, 0);
        assert_eq!(report.dropped_frames, 0);
        assert_eq!(report.decode_samples, 0);
        assert_eq!(report.avg_total, Duration::ZERO);
        assert!(report.uptime < Duration::from_secs(5));
    }
}
