// SPDX-License-Identifier: MPL-2.0

//! Locally buffered items and the collections they come from.

use std::{collections::VecDeque, path::PathBuf};

use loopframe_config::{CollectionEntry, LoopStyle};

/// A configured collection and its position in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    /// Tag carried by every background result for this collection.
    pub index: usize,
    pub entry: CollectionEntry,
}

impl Collection {
    /// Number the configured collections in order.
    pub fn from_entries(entries: &[CollectionEntry]) -> Vec<Self> {
        entries
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, entry)| Self { index, entry })
            .collect()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    #[must_use]
    pub fn loop_style(&self) -> LoopStyle {
        self.entry.loop_style
    }
}

/// One fully downloaded, playable file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSource {
    pub path: PathBuf,
    /// Index of the collection the item was fetched for.
    pub collection: usize,
    pub loop_style: LoopStyle,
}

/// Items waiting to play, head first, plus the remote fetch cursor.
///
/// The head is the item currently playing. Batches land whole or not at all;
/// an in-flight download is never represented here.
#[derive(Debug, Default)]
pub struct PlaybackBuffer {
    items: VecDeque<MediaSource>,
    next_fetch_index: usize,
}

impl PlaybackBuffer {
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn head(&self) -> Option<&MediaSource> {
        self.items.front()
    }

    pub fn pop_head(&mut self) -> Option<MediaSource> {
        self.items.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MediaSource> {
        self.items.iter()
    }

    /// Remote index the next download starts from.
    #[must_use]
    pub fn next_fetch_index(&self) -> usize {
        self.next_fetch_index
    }

    /// Append a downloaded batch fetched from `start` and move the cursor past
    /// it, wrapping to the beginning at end of collection.
    pub fn append_batch(
        &mut self,
        batch: impl IntoIterator<Item = MediaSource>,
        start: usize,
        end_of_collection: bool,
    ) {
        let before = self.items.len();
        self.items.extend(batch);
        let fetched = self.items.len() - before;

        self.next_fetch_index = if end_of_collection {
            0
        } else {
            start + fetched
        };
    }

    /// Replace everything with a fresh batch fetched from the start of a
    /// collection. Returns the items that were dropped.
    pub fn install(
        &mut self,
        batch: impl IntoIterator<Item = MediaSource>,
        end_of_collection: bool,
    ) -> Vec<MediaSource> {
        let dropped = self.items.drain(..).collect();
        self.next_fetch_index = 0;
        self.append_batch(batch, 0, end_of_collection);
        dropped
    }
}
