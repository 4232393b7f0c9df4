// SPDX-License-Identifier: MPL-2.0

//! Fixed-capacity moving average over frame timings.

use std::sync::Mutex;
use std::time::Duration;

/// Default number of samples kept per window (one second at 60 ticks).
pub const DEFAULT_WINDOW: usize = 60;

struct Ring {
    samples: Vec<Duration>,
    /// Slot the next sample is written to.
    next: usize,
    /// Number of valid samples (saturates at capacity).
    len: usize,
    sum: Duration,
}

/// Circular buffer of durations with an O(1) running average.
///
/// The sample storage is allocated once; adding to a full window evicts the
/// oldest sample by subtracting it from the running sum.
pub struct RollingWindow {
    ring: Mutex<Ring>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                samples: vec![Duration::ZERO; capacity],
                next: 0,
                len: 0,
                sum: Duration::ZERO,
            }),
            capacity,
        }
    }

    pub fn add(&self, sample: Duration) {
        let Ok(mut ring) = self.ring.lock() else {
            return;
        };

        let slot = ring.next;
        if ring.len == self.capacity {
            let evicted = ring.samples[slot];
            ring.sum = ring.sum.saturating_sub(evicted);
        } else {
            ring.len += 1;
        }

        ring.samples[slot] = sample;
        ring.sum = ring.sum.saturating_add(sample);
        ring.next = (slot + 1) % self.capacity;
    }

    /// Mean of the stored samples, or zero while the window is empty.
    pub fn average(&self) -> Duration {
        let Ok(ring) = self.ring.lock() else {
            return Duration::ZERO;
        };
        if ring.len == 0 {
            return Duration::ZERO;
        }
        ring.sum / ring.len as u32
    }

    pub fn count(&self) -> usize {
        self.ring.lock().map(|ring| ring.len).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reset(&self) {
        if let Ok(mut ring) = self.ring.lock() {
            ring.next = 0;
            ring.len = 0;
            ring.sum = Duration::ZERO;
        }
    }
}

impl Default for RollingWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl std::fmt::Debug for RollingWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollingWindow")
            .field("capacity", &self.capacity)
            .field("count", &self.count())
            .field("average", &self.average())
            .finish()
    }
}
