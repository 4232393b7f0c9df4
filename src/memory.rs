// SPDX-License-Identifier: MPL-2.0

//! Host memory sampling and pressure tiers.
//!
//! Every buffered video can cost ~200MB resident once it is decoding, so the
//! prefetch depth is derived from available memory more conservatively than
//! the pressure tiers themselves.

use std::path::PathBuf;

use tracing::debug;

const MEMINFO: &str = "/proc/meminfo";

/// Memory figures in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryInfo {
    pub total_mb: u64,
    pub available_mb: u64,
    pub used_mb: u64,
    pub free_mb: u64,
}

/// Ordinal pressure tiers, from no pressure to near out-of-memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemoryPressureLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl MemoryPressureLevel {
    /// Whether background downloads must be held back.
    #[must_use]
    pub fn blocks_prefetch(self) -> bool {
        self >= Self::High
    }
}

/// Classify available memory into a pressure tier.
#[must_use]
pub fn classify(available_mb: u64) -> MemoryPressureLevel {
    match available_mb {
        0..100 => MemoryPressureLevel::Critical,
        100..200 => MemoryPressureLevel::High,
        200..400 => MemoryPressureLevel::Medium,
        400..800 => MemoryPressureLevel::Low,
        _ => MemoryPressureLevel::None,
    }
}

/// Number of items worth keeping buffered at this much available memory.
#[must_use]
pub fn recommended_prefetch_depth(available_mb: u64) -> usize {
    match available_mb {
        0..400 => 0,
        400..700 => 1,
        700..1000 => 2,
        _ => 3,
    }
}

/// Where memory figures come from.
pub trait MemorySource {
    fn read(&self) -> eyre::Result<MemoryInfo>;
}

/// Reads `/proc/meminfo`, falling back to `sysinfo(2)` when `MemAvailable` is missing.
#[derive(Debug, Clone)]
pub struct ProcMemory {
    path: PathBuf,
}

impl ProcMemory {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from(MEMINFO),
        }
    }

    fn read_sysinfo() -> eyre::Result<MemoryInfo> {
        let info = nix::sys::sysinfo::sysinfo()?;
        let total_mb = info.ram_total() / (1024 * 1024);
        let free_mb = info.ram_unused() / (1024 * 1024);
        Ok(MemoryInfo {
            total_mb,
            available_mb: free_mb,
            used_mb: total_mb.saturating_sub(free_mb),
            free_mb,
        })
    }
}

impl Default for ProcMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource for ProcMemory {
    fn read(&self) -> eyre::Result<MemoryInfo> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => match parse_meminfo(&text) {
                Some(info) => Ok(info),
                None => {
                    debug!(path = %self.path.display(), "meminfo lacks MemAvailable, using sysinfo");
                    Self::read_sysinfo()
                }
            },
            Err(why) => {
                debug!(path = %self.path.display(), %why, "meminfo unreadable, using sysinfo");
                Self::read_sysinfo()
            }
        }
    }
}

/// Parse the `MemTotal`, `MemAvailable` and `MemFree` lines (values in kB).
fn parse_meminfo(text: &str) -> Option<MemoryInfo> {
    let mut total = None;
    let mut available = None;
    let mut free = None;

    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Ok(kb) = value.parse::<u64>() else {
            continue;
        };
        match key {
            "MemTotal:" => total = Some(kb),
            "MemAvailable:" => available = Some(kb),
            "MemFree:" => free = Some(kb),
            _ => {}
        }
    }

    let (total_mb, available_mb) = (total? / 1024, available? / 1024);
    Some(MemoryInfo {
        total_mb,
        available_mb,
        used_mb: total_mb.saturating_sub(available_mb),
        free_mb: free.unwrap_or(0) / 1024,
    })
}

/// Samples memory on every call; pressure must reflect the current instant.
pub struct MemoryPressureEstimator {
    source: Box<dyn MemorySource>,
}

impl MemoryPressureEstimator {
    pub fn new(source: Box<dyn MemorySource>) -> Self {
        Self { source }
    }

    pub fn sample(&self) -> eyre::Result<MemoryInfo> {
        self.source.read()
    }

    #[must_use]
    pub fn classify(&self, available_mb: u64) -> MemoryPressureLevel {
        classify(available_mb)
    }

    #[must_use]
    pub fn recommended_prefetch_depth(&self, available_mb: u64) -> usize {
        recommended_prefetch_depth(available_mb)
    }
}

impl Default for MemoryPressureEstimator {
    fn default() -> Self {
        Self::new(Box::new(ProcMemory::new()))
    }
}

impl std::fmt::Debug for MemoryPressureEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPressureEstimator").finish_non_exhaustive()
    }
}
