// SPDX-License-Identifier: MPL-2.0

//! Background prefetching and collection switching.
//!
//! The [`PrefetchOrchestrator`] lives on the tick loop and is the only owner
//! of the [`PlaybackBuffer`], the active collection and the [`Player`].
//! Downloads run on background threads and report back through single-slot
//! mailboxes that are polled once per tick and never waited on.
//!
//! - At most one fetch and one switch are in flight. A request to advance
//!   while a fetch is running only sets a queued flag.
//! - Every result is tagged with the collection index it was issued for.
//!   Results whose tag no longer matches are dropped without touching the
//!   buffer or the disk.
//! - Fetches and collection switches are held back under high memory
//!   pressure and retried later.
//! - Installing a new collection abandons any fetch issued before it.

mod buffer;
mod storage;
mod task;

pub use buffer::{Collection, MediaSource, PlaybackBuffer};
pub use storage::{DirectoryStorage, FetchError, RemoteStorage, Segment};

use std::{
    path::Path,
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use loopframe_config::PrefetchSettings;
use tracing::{debug, error, info, warn};

use self::task::{Outcome, Pending};
use crate::{
    decoder::DecoderFactory,
    memory::{MemoryInfo, MemoryPressureEstimator, MemoryPressureLevel},
    player::{LoopMode, Player, PlayerError},
};

/// Memory assumed when sampling fails: low pressure, one buffered item.
const FALLBACK_AVAILABLE_MB: u64 = 400;

/// How often an idle, empty orchestrator retries fetching.
const IDLE_RETRY: Duration = Duration::from_secs(10);

const TASK_NAME: &str = "loopframe-fetch";

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Playback(#[from] PlayerError),
    #[error("no collection with index {0}")]
    UnknownCollection(usize),
}

pub struct PrefetchOrchestrator {
    collections: Vec<Collection>,
    storage: Arc<dyn RemoteStorage>,
    factory: Rc<dyn DecoderFactory>,
    memory: MemoryPressureEstimator,
    settings: PrefetchSettings,
    rate: f64,
    item_duration: Option<Duration>,

    buffer: PlaybackBuffer,
    active: usize,
    requested: usize,
    player: Option<Player>,
    /// Incremented whenever a different item starts playing.
    generation: u64,
    item_started: Option<Instant>,

    fetch: Option<Pending>,
    switch: Option<Pending>,
    advance_queued: bool,
    next_id: u64,
    retry_at: Option<Instant>,
    switch_retry_at: Option<Instant>,
    last_error: Option<OrchestratorError>,
}

impl PrefetchOrchestrator {
    /// `collections` must not be empty; the first one starts active.
    pub fn new(
        collections: Vec<Collection>,
        storage: Arc<dyn RemoteStorage>,
        factory: Rc<dyn DecoderFactory>,
        memory: MemoryPressureEstimator,
    ) -> eyre::Result<Self> {
        if collections.is_empty() {
            return Err(eyre::eyre!("no collections configured"));
        }

        Ok(Self {
            collections,
            storage,
            factory,
            memory,
            settings: PrefetchSettings::default(),
            rate: 1.0,
            item_duration: None,
            buffer: PlaybackBuffer::default(),
            active: 0,
            requested: 0,
            player: None,
            generation: 0,
            item_started: None,
            fetch: None,
            switch: None,
            advance_queued: false,
            next_id: 0,
            retry_at: None,
            switch_retry_at: None,
            last_error: None,
        })
    }

    #[must_use]
    pub fn with_settings(mut self, settings: PrefetchSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    /// Move on to the next item after it has played this long.
    #[must_use]
    pub fn with_item_duration(mut self, duration: Option<Duration>) -> Self {
        self.item_duration = duration;
        self
    }

    /// Issue the first fetch.
    pub fn start(&mut self, now: Instant) {
        info!(
            collection = self.collections[self.active].name(),
            collections = self.collections.len(),
            "Starting prefetch"
        );
        self.maybe_prefetch(now);
    }

    /// Integrate finished background work and start whatever is now due.
    /// Never blocks.
    pub fn poll(&mut self, now: Instant) {
        self.poll_fetch(now);
        self.poll_switch(now);

        if self.requested != self.active
            && self.switch.is_none()
            && self.switch_retry_at.is_none_or(|at| now >= at)
        {
            self.launch_switch(now);
        }

        if self.player.is_none() && self.switch.is_none() {
            if !self.buffer.is_empty() {
                self.start_head(now);
            } else if self.fetch.is_none() && self.retry_at.is_none_or(|at| now >= at) {
                self.maybe_prefetch(now);
            }
        }

        let item_done = match (&self.player, self.item_started, self.item_duration) {
            (Some(player), _, _) if player.is_ended() => true,
            (Some(_), Some(started), Some(limit)) => now.saturating_duration_since(started) >= limit,
            _ => false,
        };
        if item_done && !self.advance_queued {
            self.next_video(now);
        }
    }

    /// Move past the current item.
    ///
    /// While a fetch is in flight the request is queued and performed once
    /// the fetch completes; repeated requests collapse into one.
    pub fn next_video(&mut self, now: Instant) {
        if self.fetch.is_some() {
            if !self.advance_queued {
                debug!("Fetch in flight, queueing advance");
            }
            self.advance_queued = true;
            return;
        }

        self.stop_player();
        if let Some(done) = self.buffer.pop_head() {
            remove_item(&done.path);
        }
        self.start_head(now);
        self.maybe_prefetch(now);
    }

    /// Record a playback failure of the current item and move on.
    pub fn playback_failed(&mut self, why: PlayerError, now: Instant) {
        error!(%why, "Playback failed, skipping item");
        self.last_error = Some(why.into());
        // A queued advance was aimed at the failed item.
        self.advance_queued = false;
        self.stop_player();
        if let Some(bad) = self.buffer.pop_head() {
            remove_item(&bad.path);
        }
        self.start_head(now);
        self.maybe_prefetch(now);
    }

    /// Ask for a different collection. Takes effect once a batch from it
    /// has been downloaded.
    pub fn request_collection(&mut self, index: usize) -> Result<(), OrchestratorError> {
        if index >= self.collections.len() {
            return Err(OrchestratorError::UnknownCollection(index));
        }
        if index != self.requested {
            info!(
                from = self.collections[self.active].name(),
                to = self.collections[index].name(),
                "Collection switch requested"
            );
            self.switch_retry_at = None;
        }
        self.requested = index;
        Ok(())
    }

    /// Items the buffer should hold right now, and the pressure it was
    /// derived from.
    fn target_depth(&self) -> (usize, MemoryPressureLevel) {
        let info = self.memory.sample().unwrap_or_else(|why| {
            warn!(%why, "Memory sampling failed, assuming low pressure");
            MemoryInfo {
                available_mb: FALLBACK_AVAILABLE_MB,
                ..MemoryInfo::default()
            }
        });

        let level = self.memory.classify(info.available_mb);
        let mut depth = self
            .memory
            .recommended_prefetch_depth(info.available_mb)
            .min(self.settings.max_depth);

        // Never leave the screen without anything queued.
        if self.buffer.is_empty() {
            depth = depth.max(1);
        }

        (depth, level)
    }

    fn maybe_prefetch(&mut self, now: Instant) {
        if self.fetch.is_some() {
            return;
        }
        if self.requested != self.active {
            debug!("Collection switch pending, not prefetching");
            return;
        }

        let (depth, level) = self.target_depth();
        let shortfall = depth.saturating_sub(self.buffer.len());
        if shortfall == 0 {
            return;
        }

        if level.blocks_prefetch() {
            warn!(?level, shortfall, "Memory pressure too high, skipping prefetch");
            self.retry_at = Some(now + IDLE_RETRY);
            return;
        }
        if level == MemoryPressureLevel::Medium {
            warn!(shortfall, "Prefetching under medium memory pressure");
        }

        let start = self.buffer.next_fetch_index();
        if let Some(pending) = self.launch(self.active, start, shortfall, now) {
            self.fetch = Some(pending);
        }
    }

    fn launch(&mut self, tag: usize, start: usize, count: usize, now: Instant) -> Option<Pending> {
        let collection = self.collections[tag].clone();
        let storage = Arc::clone(&self.storage);
        let id = self.next_id;
        self.next_id += 1;

        debug!(id, collection = collection.name(), start, count, "Launching download");

        match task::spawn(TASK_NAME, move || {
            storage.download_segment(&collection, start, count)
        }) {
            Ok(rx) => Some(Pending {
                rx,
                id,
                tag,
                start,
                started: now,
            }),
            Err(why) => {
                error!(%why, "Failed to spawn download task");
                self.last_error = Some(FetchError::Spawn(why).into());
                self.retry_at = Some(now + IDLE_RETRY);
                None
            }
        }
    }

    fn poll_fetch(&mut self, now: Instant) {
        let Some(pending) = &self.fetch else {
            return;
        };

        let outcome = match pending.poll() {
            Some(outcome) => outcome,
            None if pending.expired(now, self.settings.fetch_timeout()) => {
                warn!(id = pending.id, "Fetch timed out, abandoning it");
                Err(FetchError::TimedOut(now.saturating_duration_since(pending.started)))
            }
            None => return,
        };

        if let Some(pending) = self.fetch.take() {
            self.finish_fetch(&pending, outcome, now);
        }

        if std::mem::take(&mut self.advance_queued) {
            self.next_video(now);
        } else if self.retry_at.is_none() {
            self.maybe_prefetch(now);
        }
    }

    fn finish_fetch(&mut self, pending: &Pending, outcome: Outcome, now: Instant) {
        if pending.tag != self.active || pending.tag != self.requested {
            info!(
                id = pending.id,
                tag = pending.tag,
                active = self.active,
                requested = self.requested,
                "Discarding stale fetch result"
            );
            return;
        }

        match outcome {
            Ok(segment) => {
                let collection = &self.collections[pending.tag];
                let fetched = segment.paths.len();
                self.buffer.append_batch(
                    segment.paths.into_iter().map(|path| MediaSource {
                        path,
                        collection: collection.index,
                        loop_style: collection.loop_style(),
                    }),
                    pending.start,
                    segment.end_of_collection,
                );
                info!(
                    id = pending.id,
                    fetched,
                    buffered = self.buffer.len(),
                    next = self.buffer.next_fetch_index(),
                    "Fetch complete"
                );
                if fetched > 0 {
                    self.retry_at = None;
                } else {
                    self.retry_at = Some(now + IDLE_RETRY);
                }

                if self.player.is_none() {
                    self.start_head(now);
                }
            }
            Err(why) => {
                warn!(id = pending.id, %why, "Fetch failed");
                self.last_error = Some(why.into());
                self.retry_at = Some(now + IDLE_RETRY);
            }
        }
    }

    fn launch_switch(&mut self, now: Instant) {
        let (depth, level) = self.target_depth();
        let tag = self.requested;
        if level.blocks_prefetch() {
            warn!(
                ?level,
                collection = self.collections[tag].name(),
                "Memory pressure too high, deferring collection switch"
            );
            self.switch_retry_at = Some(now + IDLE_RETRY);
            return;
        }

        self.switch_retry_at = None;
        if let Some(pending) = self.launch(tag, 0, depth.max(1), now) {
            self.switch = Some(pending);
        } else {
            self.requested = self.active;
        }
    }

    fn poll_switch(&mut self, now: Instant) {
        let Some(pending) = &self.switch else {
            return;
        };

        let outcome = match pending.poll() {
            Some(outcome) => outcome,
            None if pending.expired(now, self.settings.fetch_timeout()) => {
                warn!(id = pending.id, "Collection switch timed out, abandoning it");
                Err(FetchError::TimedOut(now.saturating_duration_since(pending.started)))
            }
            None => return,
        };

        if let Some(pending) = self.switch.take() {
            self.finish_switch(&pending, outcome, now);
        }
    }

    fn finish_switch(&mut self, pending: &Pending, outcome: Outcome, now: Instant) {
        if pending.tag != self.requested {
            info!(
                id = pending.id,
                tag = pending.tag,
                requested = self.requested,
                "Discarding stale switch result"
            );
            return;
        }

        let collection = &self.collections[pending.tag];
        let segment = match outcome {
            Ok(segment) if segment.paths.is_empty() => {
                Err(FetchError::EmptyCollection(collection.name().to_string()))
            }
            other => other,
        };

        let segment = match segment {
            Ok(segment) => segment,
            Err(why) => {
                error!(collection = collection.name(), %why, "Collection switch abandoned");
                self.last_error = Some(why.into());
                self.requested = self.active;
                return;
            }
        };

        info!(
            id = pending.id,
            from = self.collections[self.active].name(),
            to = collection.name(),
            items = segment.paths.len(),
            "Switching collection"
        );

        let batch: Vec<MediaSource> = segment
            .paths
            .into_iter()
            .map(|path| MediaSource {
                path,
                collection: collection.index,
                loop_style: collection.loop_style(),
            })
            .collect();

        // Its start index belongs to the replaced buffer.
        if let Some(stale) = self.fetch.take() {
            info!(id = stale.id, "Abandoning fetch issued before the switch");
        }

        self.stop_player();
        for old in self.buffer.install(batch, segment.end_of_collection) {
            remove_item(&old.path);
        }
        self.active = pending.tag;
        // Queued advances were meant for the old collection.
        self.advance_queued = false;
        self.retry_at = None;
        self.start_head(now);
        self.maybe_prefetch(now);
    }

    /// Start playing the buffer head, dropping heads that cannot be opened.
    fn start_head(&mut self, now: Instant) {
        while let Some(head) = self.buffer.head() {
            let mode = LoopMode::from(head.loop_style);
            match Player::open(&head.path, Rc::clone(&self.factory), mode, self.rate, now) {
                Ok(player) => {
                    self.player = Some(player);
                    self.generation += 1;
                    self.item_started = Some(now);
                    return;
                }
                Err(why) => {
                    error!(path = %head.path.display(), %why, "Item is unplayable, skipping");
                    self.last_error = Some(why.into());
                    if let Some(bad) = self.buffer.pop_head() {
                        remove_item(&bad.path);
                    }
                }
            }
        }

        debug!("Buffer empty, nothing to play");
        self.player = None;
        self.item_started = None;
    }

    fn stop_player(&mut self) {
        if let Some(mut player) = self.player.take() {
            player.stop();
        }
        self.item_started = None;
    }

    #[must_use]
    pub fn player(&self) -> Option<&Player> {
        self.player.as_ref()
    }

    pub fn player_mut(&mut self) -> Option<&mut Player> {
        self.player.as_mut()
    }

    /// Changes whenever a different item starts playing.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn buffer(&self) -> &PlaybackBuffer {
        &self.buffer
    }

    #[must_use]
    pub fn active_collection(&self) -> usize {
        self.active
    }

    #[must_use]
    pub fn requested_collection(&self) -> usize {
        self.requested
    }

    #[must_use]
    pub fn collections(&self) -> &[Collection] {
        &self.collections
    }

    #[must_use]
    pub fn fetch_in_flight(&self) -> bool {
        self.fetch.is_some()
    }

    #[must_use]
    pub fn switch_in_flight(&self) -> bool {
        self.switch.is_some()
    }

    #[must_use]
    pub fn advance_queued(&self) -> bool {
        self.advance_queued
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&OrchestratorError> {
        self.last_error.as_ref()
    }

    pub fn take_last_error(&mut self) -> Option<OrchestratorError> {
        self.last_error.take()
    }
}

impl Drop for PrefetchOrchestrator {
    fn drop(&mut self) {
        self.stop_player();
    }
}

impl std::fmt::Debug for PrefetchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchOrchestrator")
            .field("active", &self.active)
            .field("requested", &self.requested)
            .field("buffered", &self.buffer.len())
            .field("fetch_in_flight", &self.fetch.is_some())
            .field("switch_in_flight", &self.switch.is_some())
            .field("advance_queued", &self.advance_queued)
            .finish_non_exhaustive()
    }
}

fn remove_item(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed played item"),
        Err(why) => warn!(path = %path.display(), %why, "Failed to remove played item"),
    }
}

#[cfg(test)]
mod tests;
