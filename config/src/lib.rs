// SPDX-License-Identifier: MPL-2.0-only

use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

pub mod env;

pub const NAME: &str = "loopframe";
pub const CONFIG_FILE: &str = "config.ron";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "LOOPFRAME_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },
    #[error("no config directory available on this system")]
    NoConfigDir,
    #[error("collection {0:?} is configured twice")]
    DuplicateCollection(String),
}

/// How a collection's items loop while they are on screen.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoopStyle {
    /// Play once; the next item starts at end of stream.
    Once,
    /// Restart from the first frame at end of stream.
    #[default]
    Loop,
    /// Play forward, then replay the decoded frames in reverse.
    Bounce,
}

/// Order in which a collection's items are fetched.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum SamplingMethod {
    // Fetch items in alphanumeric order
    #[default]
    Alphanumeric,
    // Reshuffle the collection at the start of every pass
    Random,
}

/// A remote collection of looping videos.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Setters)]
#[serde(deny_unknown_fields)]
#[must_use]
pub struct CollectionEntry {
    /// display name of the collection
    #[setters(skip)]
    pub name: String,
    /// the bucket holding the collection, relative to the storage root
    #[setters(skip)]
    pub bucket: String,
    /// folder inside the bucket
    #[serde(default)]
    pub folder: String,
    /// how items from this collection loop
    #[serde(default)]
    pub loop_style: LoopStyle,
    #[serde(default)]
    pub sampling: SamplingMethod,
}

impl CollectionEntry {
    pub fn new(name: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bucket: bucket.into(),
            folder: String::new(),
            loop_style: LoopStyle::default(),
            sampling: SamplingMethod::default(),
        }
    }

    /// Fallback in case no collection is configured
    pub fn fallback() -> Self {
        Self::new("default", "videos")
    }

    /// Location of the collection relative to the storage root.
    #[must_use]
    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::from(&self.bucket);
        if !self.folder.is_empty() {
            path.push(&self.folder);
        }
        path
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Setters)]
#[serde(deny_unknown_fields, default)]
#[must_use]
pub struct StorageSettings {
    /// mount point under which the collection buckets live
    pub root: PathBuf,
    /// local directory that downloaded items are written to
    #[setters(skip)]
    pub scratch_dir: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/mnt/loopframe"),
            scratch_dir: None,
        }
    }
}

impl StorageSettings {
    /// The scratch directory, defaulting to the user cache directory.
    #[must_use]
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(NAME)
                .join("scratch")
        })
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq, Setters)]
#[serde(deny_unknown_fields, default)]
#[must_use]
pub struct DecoderSettings {
    /// decoder element tried ahead of the priority ladder
    #[setters(strip_option, into)]
    pub decoder_override: Option<String>,
    /// skip every hardware candidate in the ladder
    pub force_software: bool,
    /// log every enumerable video decoder when the first file is opened
    pub debug_list: bool,
}

/// Where frames are presented.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Linux framebuffer device, e.g. `/dev/fb0`
    Framebuffer(PathBuf),
    /// Offscreen canvas of the given size
    Headless { width: u32, height: u32 },
}

impl Default for OutputTarget {
    fn default() -> Self {
        Self::Framebuffer(PathBuf::from("/dev/fb0"))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Setters)]
#[serde(deny_unknown_fields, default)]
#[must_use]
pub struct PlaybackSettings {
    /// playback speed multiplier
    pub rate: f64,
    /// seconds each item stays on screen before the next one starts
    pub item_duration_secs: u64,
    /// display ticks per second
    pub tick_hz: u32,
    pub output: OutputTarget,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            rate: 1.0,
            item_duration_secs: 300,
            tick_hz: 60,
            output: OutputTarget::default(),
        }
    }
}

impl PlaybackSettings {
    #[must_use]
    pub fn item_duration(&self) -> Option<Duration> {
        (self.item_duration_secs > 0).then(|| Duration::from_secs(self.item_duration_secs))
    }

    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_hz.max(1)))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Setters)]
#[serde(deny_unknown_fields, default)]
#[must_use]
pub struct PrefetchSettings {
    /// upper bound on buffered items regardless of free memory
    pub max_depth: usize,
    /// abandon a background download after this many seconds (0 disables)
    pub fetch_timeout_secs: u64,
}

impl Default for PrefetchSettings {
    fn default() -> Self {
        Self {
            max_depth: 3,
            fetch_timeout_secs: 180,
        }
    }
}

impl PrefetchSettings {
    #[must_use]
    pub fn fetch_timeout(&self) -> Option<Duration> {
        (self.fetch_timeout_secs > 0).then(|| Duration::from_secs(self.fetch_timeout_secs))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Setters)]
#[serde(deny_unknown_fields, default)]
#[must_use]
pub struct FrameSkipSettings {
    /// average decode time that switches to reduced decoding
    pub slow_ms: u64,
    /// average decode time that switches back to full-rate decoding
    pub good_ms: u64,
    /// consecutive reports needed before the mode changes
    pub streak: u32,
    /// while skipping, decode one tick out of this many
    pub skip_interval: u32,
}

impl Default for FrameSkipSettings {
    fn default() -> Self {
        Self {
            slow_ms: 30,
            good_ms: 20,
            streak: 3,
            skip_interval: 2,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default, Setters)]
#[serde(deny_unknown_fields, default)]
#[must_use]
pub struct Config {
    pub collections: Vec<CollectionEntry>,
    pub storage: StorageSettings,
    pub decoder: DecoderSettings,
    pub playback: PlaybackSettings,
    pub prefetch: PrefetchSettings,
    pub frame_skip: FrameSkipSettings,
}

impl Config {
    /// Creates a config with fallback defaults.
    pub fn fallback() -> Self {
        Self {
            collections: vec![CollectionEntry::fallback()],
            ..Self::default()
        }
    }

    /// Default location of the config file.
    ///
    /// # Errors
    ///
    /// Fails if the platform has no config directory.
    pub fn default_path() -> Result<PathBuf, Error> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        dirs::config_dir()
            .map(|dir| dir.join(NAME).join(CONFIG_FILE))
            .ok_or(Error::NoConfigDir)
    }

    /// Load and validate the config stored at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read, does not parse, or names a collection twice.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_ron(&text).map_err(|source| Error::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;

        if config.collections.is_empty() {
            tracing::warn!("No collections configured. Using defaults.");
            config.collections.push(CollectionEntry::fallback());
        }

        Ok(config)
    }

    /// Parse a config from RON text.
    ///
    /// # Errors
    ///
    /// Fails on malformed RON or unknown fields.
    pub fn from_ron(text: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str(text)
    }

    fn validate(&self) -> Result<(), Error> {
        for (i, entry) in self.collections.iter().enumerate() {
            if self.collections[..i].iter().any(|e| e.name == entry.name) {
                return Err(Error::DuplicateCollection(entry.name.clone()));
            }
        }
        Ok(())
    }
}
