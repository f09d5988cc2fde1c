//! Piece-backed file reader
//!
//! A [`FileReader`] turns the piece cache into a seekable byte stream for one
//! file. Reads of pieces that have not been verified yet wait for the transfer
//! to complete them; before each read the pieces inside the read-ahead window
//! are handed to the transfer engine at [`Priority::Immediate`].

use std::ops::Range;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::trace;

use crate::engine::TransferEngine;
use crate::models::{FileEntry, Priority, MIB};
use crate::storage::{CacheError, MemTransfer};

/// Smallest read-ahead window
pub const MIN_READAHEAD: u64 = 8 * MIB;

/// Read-ahead for a file of `length` bytes: 5% of it, at least [`MIN_READAHEAD`],
/// never more than the file itself.
pub fn readahead_window(length: u64) -> u64 {
    readahead_window_with_min(length, MIN_READAHEAD)
}

pub fn readahead_window_with_min(length: u64, min: u64) -> u64 {
    (length / 20).max(min).min(length)
}

/// Sequential reader over one file of a transfer
pub struct FileReader {
    transfer: Arc<MemTransfer>,
    engine: Arc<dyn TransferEngine>,
    entry: FileEntry,
    piece_length: u64,
    pos: u64,
    readahead: u64,
    prioritized: Range<usize>,
    completions: watch::Receiver<u64>,
}

impl FileReader {
    pub fn new(
        transfer: Arc<MemTransfer>,
        engine: Arc<dyn TransferEngine>,
        entry: FileEntry,
    ) -> Self {
        let piece_length = transfer.layout().piece_length;
        let completions = transfer.subscribe();
        Self {
            transfer,
            engine,
            readahead: readahead_window(entry.length),
            entry,
            piece_length,
            pos: 0,
            prioritized: 0..0,
            completions,
        }
    }

    pub fn entry(&self) -> &FileEntry {
        &self.entry
    }

    pub fn len(&self) -> u64 {
        self.entry.length
    }

    pub fn is_empty(&self) -> bool {
        self.entry.length == 0
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn readahead(&self) -> u64 {
        self.readahead
    }

    pub fn set_readahead(&mut self, bytes: u64) {
        self.readahead = bytes.min(self.entry.length);
    }

    /// Move the cursor; positions past the end read as end of file.
    pub fn seek(&mut self, pos: u64) {
        self.pos = pos.min(self.entry.length);
    }

    /// Pieces covering `[pos, pos + readahead)` of the file
    fn window(&self) -> Range<usize> {
        if self.piece_length == 0 || self.pos >= self.entry.length {
            return 0..0;
        }
        let begin = self.entry.offset + self.pos;
        let end = self.entry.offset + (self.pos + self.readahead.max(1)).min(self.entry.length);
        let first = (begin / self.piece_length) as usize;
        let last = end.div_ceil(self.piece_length) as usize;
        first..last
    }

    /// Ask the engine for the pieces in the read-ahead window that it was not
    /// already asked for by this reader.
    fn prioritize(&mut self) {
        let window = self.window();
        if window == self.prioritized {
            return;
        }
        let fresh = window
            .clone()
            .filter(|piece| !self.prioritized.contains(piece))
            .filter(|piece| !self.transfer.is_complete(*piece).unwrap_or(true));
        for piece in fresh {
            self.engine.set_piece_priority(piece, Priority::Immediate);
        }
        trace!(file = self.entry.index, ?window, "read-ahead window");
        self.prioritized = window;
    }

    /// Read up to `buf.len()` bytes at the cursor, waiting until the piece
    /// holding them is complete. Returns `0` at end of file.
    ///
    /// Cancel-safe: dropping the future while it waits holds no piece lock.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, CacheError> {
        if buf.is_empty() || self.pos >= self.entry.length || self.piece_length == 0 {
            return Ok(0);
        }
        self.prioritize();

        let absolute = self.entry.offset + self.pos;
        let piece = (absolute / self.piece_length) as usize;
        let piece_offset = absolute % self.piece_length;
        let want = (buf.len() as u64)
            .min(self.piece_length - piece_offset)
            .min(self.entry.length - self.pos) as usize;

        loop {
            self.completions.borrow_and_update();
            if self.transfer.is_complete(piece)? {
                let read = self.transfer.read(piece, piece_offset, &mut buf[..want])?;
                if read.copied > 0 {
                    self.pos += read.copied as u64;
                    return Ok(read.copied);
                }
            }
            if self.completions.changed().await.is_err() {
                return Err(CacheError::Closed(self.transfer.id().clone()));
            }
        }
    }
}
