// SPDX-License-Identifier: MPL-2.0

//! Remote storage access.
//!
//! [`DirectoryStorage`] treats a mounted directory tree as the remote: each
//! collection lives at `root/bucket/folder`, and downloading copies items into
//! the scratch directory. A copy is written under a `.partial` name and only
//! renamed into place once complete, and a batch that fails part way removes
//! the copies it already made.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use loopframe_config::SamplingMethod;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::buffer::Collection;
use crate::decoder::detection::is_video_file;

/// Items downloaded by one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segment {
    /// Local paths of fully downloaded files, in collection order.
    pub paths: Vec<PathBuf>,
    /// The segment reached the last item of the collection.
    pub end_of_collection: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("collection {0:?} has no playable items")]
    EmptyCollection(String),
    #[error("download abandoned after {0:?}")]
    TimedOut(Duration),
    #[error("download task ended without a result")]
    TaskLost,
    #[error("failed to start download task: {0}")]
    Spawn(#[source] io::Error),
}

/// Source of collection items. Calls may be slow and may fail; they run on
/// background threads.
pub trait RemoteStorage: Send + Sync {
    /// Download up to `count` items starting at `start`.
    fn download_segment(
        &self,
        collection: &Collection,
        start: usize,
        count: usize,
    ) -> Result<Segment, FetchError>;
}

/// A directory tree standing in for remote storage.
#[derive(Debug)]
pub struct DirectoryStorage {
    root: PathBuf,
    scratch: PathBuf,
    /// Listing per collection index, refreshed at the start of every pass.
    listings: Mutex<HashMap<usize, Vec<PathBuf>>>,
    sequence: AtomicU64,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>, scratch: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            scratch: scratch.into(),
            listings: Mutex::default(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn from_settings(settings: &loopframe_config::StorageSettings) -> Self {
        Self::new(settings.root.clone(), settings.scratch_dir())
    }

    #[must_use]
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch
    }

    /// Create the scratch directory and remove anything left in it.
    pub fn clean_scratch(&self) -> Result<usize, FetchError> {
        let io_err = |source| FetchError::Io {
            path: self.scratch.clone(),
            source,
        };

        std::fs::create_dir_all(&self.scratch).map_err(io_err)?;

        let mut removed = 0;
        for entry in std::fs::read_dir(&self.scratch).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.is_file() {
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(why) => warn!(path = %path.display(), %why, "Failed to remove stale scratch file"),
                }
            }
        }

        if removed > 0 {
            info!(removed, dir = %self.scratch.display(), "Cleaned scratch directory");
        }
        Ok(removed)
    }

    fn scan(&self, collection: &Collection) -> Result<Vec<PathBuf>, FetchError> {
        let dir = self.root.join(collection.entry.relative_path());

        let mut items = Vec::new();
        for entry in WalkDir::new(&dir).follow_links(true) {
            let entry = entry.map_err(|why| FetchError::Io {
                path: dir.clone(),
                source: why.into(),
            })?;
            if entry.file_type().is_file() && is_video_file(entry.path()) {
                items.push(entry.into_path());
            }
        }

        match collection.entry.sampling {
            SamplingMethod::Alphanumeric => items.sort(),
            SamplingMethod::Random => items.shuffle(&mut rand::rng()),
        }

        debug!(collection = collection.name(), items = items.len(), "Scanned collection");
        Ok(items)
    }

    fn listing(&self, collection: &Collection, start: usize) -> Result<Vec<PathBuf>, FetchError> {
        let mut listings = self
            .listings
            .lock()
            .map_err(|_| FetchError::Unavailable("listing cache poisoned".into()))?;

        if start == 0 || !listings.contains_key(&collection.index) {
            let items = self.scan(collection)?;
            listings.insert(collection.index, items);
        }

        Ok(listings
            .get(&collection.index)
            .cloned()
            .unwrap_or_default())
    }

    fn copy_item(&self, source: &Path) -> Result<PathBuf, FetchError> {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "item".into());
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);

        let target = self.scratch.join(format!("{seq:06}-{name}"));
        let partial = self.scratch.join(format!("{seq:06}-{name}.partial"));

        let copied = std::fs::copy(source, &partial).and_then(|_| std::fs::rename(&partial, &target));
        if let Err(source) = copied {
            let _ = std::fs::remove_file(&partial);
            return Err(FetchError::Io {
                path: target,
                source,
            });
        }

        Ok(target)
    }
}

impl RemoteStorage for DirectoryStorage {
    fn download_segment(
        &self,
        collection: &Collection,
        start: usize,
        count: usize,
    ) -> Result<Segment, FetchError> {
        let listing = self.listing(collection, start)?;
        let end = start.saturating_add(count).min(listing.len());

        std::fs::create_dir_all(&self.scratch).map_err(|source| FetchError::Io {
            path: self.scratch.clone(),
            source,
        })?;

        let mut paths = Vec::with_capacity(end.saturating_sub(start));
        for source in listing.get(start..end).unwrap_or_default() {
            match self.copy_item(source) {
                Ok(path) => paths.push(path),
                Err(why) => {
                    for path in &paths {
                        let _ = std::fs::remove_file(path);
                    }
                    return Err(why);
                }
            }
        }

        info!(
            collection = collection.name(),
            start,
            fetched = paths.len(),
            total = listing.len(),
            "Downloaded segment"
        );

        Ok(Segment {
            paths,
            end_of_collection: end >= listing.len(),
        })
    }
}
