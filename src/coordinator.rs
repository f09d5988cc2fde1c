//! Priority and eviction coordinator
//!
//! Consumes [`PlayerEvent`]s from one playback session and keeps the transfer
//! engine and the piece cache in step with the playlist: the playing item is
//! fetched at normal priority with its first pieces boosted, later items trail
//! at low priority, and items the playlist has moved past are dropped from
//! memory and never fetched again unless playback returns to them.

use std::ops::Range;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::TransferEngine;
use crate::models::{FileEntry, Priority, TransferLayout};
use crate::player::{PlayerEvent, SessionEnd};
use crate::storage::MemTransfer;

/// What one position change did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: usize,
    pub to: usize,
    /// Playlist indices whose pieces were released
    pub evicted: Vec<usize>,
}

/// Drop every file and piece of the transfer back to [`Priority::None`].
///
/// Nothing is fetched afterwards until a session or reader asks again.
pub fn release_priorities(engine: &dyn TransferEngine, layout: &TransferLayout) {
    for file in 0..layout.files.len() {
        engine.set_file_priority(file, Priority::None);
    }
    engine.set_piece_range_priority(0..layout.piece_count(), Priority::None);
}

pub struct PlaybackCoordinator {
    engine: Arc<dyn TransferEngine>,
    transfer: Arc<MemTransfer>,
    items: Vec<FileEntry>,
    evicted: Vec<bool>,
    current: usize,
}

impl PlaybackCoordinator {
    /// `items` in playlist order; `start` is the item playback begins with.
    pub fn new(
        engine: Arc<dyn TransferEngine>,
        transfer: Arc<MemTransfer>,
        items: Vec<FileEntry>,
        start: usize,
    ) -> Self {
        let evicted = vec![false; items.len()];
        Self {
            engine,
            transfer,
            items,
            evicted,
            current: start,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn items(&self) -> &[FileEntry] {
        &self.items
    }

    pub fn is_evicted(&self, index: usize) -> bool {
        self.evicted.get(index).copied().unwrap_or(false)
    }

    /// Initial priorities, issued once before the player starts. Whatever
    /// earlier sessions or readers asked for is dropped first, so files outside
    /// this playlist stop being fetched.
    pub fn apply_start(&mut self) {
        release_priorities(self.engine.as_ref(), self.transfer.layout());
        self.prioritize();
    }

    /// React to the player reporting playlist position `to`.
    ///
    /// Moving forward releases every item in `[from, to)`; moving back only
    /// reprioritizes. Repeats of the current position and out-of-range values
    /// are ignored.
    pub fn on_position(&mut self, to: usize) -> Option<Transition> {
        let from = self.current;
        if to == from {
            return None;
        }
        if to >= self.items.len() {
            warn!(position = to, items = self.items.len(), "player reported unknown playlist position");
            return None;
        }

        let mut evicted = Vec::new();
        if to > from {
            for index in from..to {
                if !self.evicted[index] {
                    self.evict(index);
                    evicted.push(index);
                }
            }
        }
        if !self.evicted[from] {
            self.engine
                .set_piece_range_priority(self.items[from].startup_pieces(), Priority::None);
        }
        self.current = to;
        self.prioritize();

        info!(from, to, evicted = evicted.len(), "playlist moved");
        Some(Transition { from, to, evicted })
    }

    fn evict(&mut self, index: usize) {
        self.evicted[index] = true;
        let file = self.items[index].index;
        let pieces = self.exclusive_pieces(index);

        self.engine.set_file_priority(file, Priority::None);
        self.engine
            .set_piece_range_priority(pieces.clone(), Priority::None);
        match self.transfer.evict_range(pieces.start, pieces.end) {
            Ok(released) => debug!(item = index, ?pieces, released, "released played item"),
            Err(e) => warn!(item = index, "failed to release pieces: {}", e),
        }
    }

    /// Piece range of item `index` minus boundary pieces shared with items still in use.
    fn exclusive_pieces(&self, index: usize) -> Range<usize> {
        let Range { mut start, mut end } = self.items[index].pieces();
        let in_use = |piece: usize| {
            self.items
                .iter()
                .enumerate()
                .any(|(i, item)| i != index && !self.evicted[i] && item.pieces().contains(&piece))
        };
        while start < end && in_use(start) {
            start += 1;
        }
        while end > start && in_use(end - 1) {
            end -= 1;
        }
        start..end
    }

    fn prioritize(&mut self) {
        self.evicted[self.current] = false;
        for (index, item) in self.items.iter().enumerate() {
            let priority = if index == self.current {
                Priority::Normal
            } else if self.evicted[index] {
                Priority::None
            } else {
                Priority::Low
            };
            self.engine.set_file_priority(item.index, priority);
        }

        let boost = self.items[self.current].startup_pieces();
        debug!(item = self.current, ?boost, "boosting start of item");
        self.engine
            .set_piece_range_priority(boost, Priority::Immediate);
    }

    /// Handle events until the session ends; returns how it ended.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<PlayerEvent>) -> SessionEnd {
        while let Some(event) = events.recv().await {
            match event {
                PlayerEvent::PlaylistPos(position) => {
                    self.on_position(position);
                }
                PlayerEvent::Ended(end) => {
                    info!("playback session ended: {}", end);
                    return end;
                }
            }
        }
        SessionEnd::WaitFailed("player event channel closed".to_string())
    }
}
