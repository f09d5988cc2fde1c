//! RAM-backed piece cache
//!
//! [`MemoryStorage`] maps transfer ids to [`MemTransfer`]s, each of which maps
//! piece indices to lazily created [`PieceEntry`] buffers. The piece map lock is
//! only held long enough to look up or insert an entry; reads and writes then
//! serialize on the entry's own lock, so different pieces never contend.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::models::{TransferId, TransferLayout};

/// Errors from piece cache operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("transfer {0} is closed")]
    Closed(TransferId),
    #[error("unknown transfer {0}")]
    UnknownTransfer(TransferId),
}

/// Outcome of a piece read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceRead {
    /// Bytes copied into the caller's buffer
    pub copied: usize,
    /// The buffer ended before the caller's buffer was filled
    pub end_of_data: bool,
}

impl PieceRead {
    fn eof() -> Self {
        Self {
            copied: 0,
            end_of_data: true,
        }
    }
}

// =============================================================================
// Piece Entry
// =============================================================================

#[derive(Debug, Default)]
struct PieceData {
    data: Vec<u8>,
    complete: bool,
}

/// One piece's bytes plus its completion flag, behind a per-piece lock
#[derive(Debug)]
pub struct PieceEntry {
    declared_length: usize,
    inner: RwLock<PieceData>,
}

impl PieceEntry {
    fn new(declared_length: u64) -> Self {
        Self {
            declared_length: usize::try_from(declared_length).unwrap_or(usize::MAX),
            inner: RwLock::new(PieceData::default()),
        }
    }

    /// Size the piece is expected to have once fully written
    pub fn declared_length(&self) -> usize {
        self.declared_length
    }

    /// Bytes currently held
    pub fn len(&self) -> usize {
        self.inner.read().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy bytes starting at `offset` into `buf`.
    ///
    /// Offsets at or past the current length yield zero bytes and end-of-data.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> PieceRead {
        let piece = self.inner.read();
        let Ok(offset) = usize::try_from(offset) else {
            return PieceRead::eof();
        };
        if offset >= piece.data.len() {
            return PieceRead::eof();
        }
        let available = &piece.data[offset..];
        let copied = available.len().min(buf.len());
        buf[..copied].copy_from_slice(&available[..copied]);
        PieceRead {
            copied,
            end_of_data: copied < buf.len(),
        }
    }

    /// Copy `buf` in at `offset`, growing the buffer to `offset + buf.len()` if needed.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = offset.saturating_add(buf.len());
        let mut piece = self.inner.write();
        if end > piece.data.len() {
            if piece.data.capacity() == 0 {
                let want = self.declared_length.max(end);
                piece.data.reserve_exact(want);
            }
            piece.data.resize(end, 0);
        }
        piece.data[offset..end].copy_from_slice(buf);
        buf.len()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.read().complete
    }

    fn set_complete(&self, complete: bool) {
        self.inner.write().complete = complete;
    }
}

// =============================================================================
// Transfer
// =============================================================================

/// All in-memory pieces of one transfer
#[derive(Debug)]
pub struct MemTransfer {
    layout: TransferLayout,
    // `None` once closed
    pieces: Mutex<Option<HashMap<usize, Arc<PieceEntry>>>>,
    completions: watch::Sender<u64>,
}

impl MemTransfer {
    pub fn new(layout: TransferLayout) -> Self {
        let (completions, _) = watch::channel(0);
        Self {
            layout,
            pieces: Mutex::new(Some(HashMap::new())),
            completions,
        }
    }

    pub fn id(&self) -> &TransferId {
        &self.layout.id
    }

    pub fn layout(&self) -> &TransferLayout {
        &self.layout
    }

    fn closed(&self) -> CacheError {
        CacheError::Closed(self.layout.id.clone())
    }

    /// Entry for `index`, created empty with room for `declared_length` bytes if absent.
    pub fn get_or_create(
        &self,
        index: usize,
        declared_length: u64,
    ) -> Result<Arc<PieceEntry>, CacheError> {
        let mut guard = self.pieces.lock();
        let pieces = guard.as_mut().ok_or_else(|| self.closed())?;
        let entry = pieces
            .entry(index)
            .or_insert_with(|| Arc::new(PieceEntry::new(declared_length)));
        Ok(Arc::clone(entry))
    }

    fn existing(&self, index: usize) -> Result<Option<Arc<PieceEntry>>, CacheError> {
        let guard = self.pieces.lock();
        let pieces = guard.as_ref().ok_or_else(|| self.closed())?;
        Ok(pieces.get(&index).cloned())
    }

    /// Entry handle using the layout's declared size for `index`
    pub fn piece(&self, index: usize) -> Result<Arc<PieceEntry>, CacheError> {
        self.get_or_create(index, self.layout.piece_size(index))
    }

    /// Read from piece `index`; never-written pieces report zero bytes and end-of-data.
    pub fn read(&self, index: usize, offset: u64, buf: &mut [u8]) -> Result<PieceRead, CacheError> {
        Ok(self.piece(index)?.read_at(offset, buf))
    }

    /// Write into piece `index`, growing its buffer as needed.
    pub fn write(&self, index: usize, offset: u64, buf: &[u8]) -> Result<usize, CacheError> {
        Ok(self.piece(index)?.write_at(offset, buf))
    }

    /// Flag piece `index` as verified and wake any reader waiting on it.
    pub fn mark_complete(&self, index: usize) -> Result<(), CacheError> {
        self.piece(index)?.set_complete(true);
        self.completions.send_modify(|generation| *generation += 1);
        Ok(())
    }

    pub fn mark_incomplete(&self, index: usize) -> Result<(), CacheError> {
        if let Some(entry) = self.existing(index)? {
            entry.set_complete(false);
        }
        Ok(())
    }

    /// Completion flag of piece `index`; absent pieces are incomplete.
    pub fn is_complete(&self, index: usize) -> Result<bool, CacheError> {
        Ok(self
            .existing(index)?
            .map(|entry| entry.is_complete())
            .unwrap_or(false))
    }

    /// Number of complete pieces in `range`
    pub fn completed_in(&self, range: Range<usize>) -> Result<usize, CacheError> {
        let guard = self.pieces.lock();
        let pieces = guard.as_ref().ok_or_else(|| self.closed())?;
        Ok(range
            .filter(|i| pieces.get(i).is_some_and(|entry| entry.is_complete()))
            .count())
    }

    /// Drop the entries for `[start, end)`. Missing entries are skipped.
    pub fn evict_range(&self, start: usize, end: usize) -> Result<usize, CacheError> {
        let evicted = {
            let mut guard = self.pieces.lock();
            let pieces = guard.as_mut().ok_or_else(|| self.closed())?;
            (start..end).filter(|i| pieces.remove(i).is_some()).count()
        };
        if evicted > 0 {
            debug!(transfer = %self.layout.id, start, end, evicted, "evicted pieces");
        }
        Ok(evicted)
    }

    /// Number of pieces currently held in memory
    pub fn resident_pieces(&self) -> usize {
        self.pieces.lock().as_ref().map(HashMap::len).unwrap_or(0)
    }

    /// Bytes currently held in memory
    pub fn resident_bytes(&self) -> usize {
        let entries: Vec<Arc<PieceEntry>> = match self.pieces.lock().as_ref() {
            Some(pieces) => pieces.values().cloned().collect(),
            None => return 0,
        };
        entries.iter().map(|entry| entry.len()).sum()
    }

    /// Receiver bumped every time a piece completes or the transfer closes
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.completions.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.pieces.lock().is_none()
    }

    /// Release every piece. Later operations fail with [`CacheError::Closed`].
    pub fn close(&self) {
        let released = self.pieces.lock().take();
        if let Some(pieces) = released {
            debug!(transfer = %self.layout.id, pieces = pieces.len(), "closed transfer");
        }
        self.completions.send_modify(|generation| *generation += 1);
    }
}

// =============================================================================
// Storage
// =============================================================================

/// Per-process registry of in-memory transfers
#[derive(Debug, Default)]
pub struct MemoryStorage {
    transfers: Mutex<HashMap<TransferId, Arc<MemTransfer>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open storage for a transfer; a previous transfer with the same id is closed.
    pub fn open_transfer(&self, layout: TransferLayout) -> Arc<MemTransfer> {
        let transfer = Arc::new(MemTransfer::new(layout));
        let previous = self
            .transfers
            .lock()
            .insert(transfer.id().clone(), Arc::clone(&transfer));
        if let Some(previous) = previous {
            previous.close();
        }
        transfer
    }

    pub fn get(&self, id: &TransferId) -> Option<Arc<MemTransfer>> {
        self.transfers.lock().get(id).cloned()
    }

    pub fn close_transfer(&self, id: &TransferId) -> Result<(), CacheError> {
        let transfer = self
            .transfers
            .lock()
            .remove(id)
            .ok_or_else(|| CacheError::UnknownTransfer(id.clone()))?;
        transfer.close();
        Ok(())
    }

    /// Close every transfer
    pub fn close(&self) {
        let transfers: Vec<_> = self.transfers.lock().drain().map(|(_, t)| t).collect();
        for transfer in transfers {
            transfer.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileInfo;

    fn transfer() -> MemTransfer {
        MemTransfer::new(TransferLayout {
            id: TransferId::new("t1"),
            name: "t1".to_string(),
            piece_length: 16,
            files: vec![FileInfo::new("a.mkv", 40)],
        })
    }

    #[test]
    fn test_write_reserves_declared_length() {
        let t = transfer();
        let entry = t.get_or_create(0, 16).unwrap();
        entry.write_at(0, b"ab");
        assert_eq!(entry.len(), 2);
        assert_eq!(entry.declared_length(), 16);
        assert!(entry.inner.read().data.capacity() >= 16);
    }

    #[test]
    fn test_partial_read_reports_end_of_data() {
        let t = transfer();
        t.write(0, 0, b"hello").unwrap();
        let mut buf = [0u8; 8];
        let read = t.read(0, 2, &mut buf).unwrap();
        assert_eq!(read.copied, 3);
        assert!(read.end_of_data);
        assert_eq!(&buf[..3], b"llo");
    }

    #[test]
    fn test_full_read_is_not_end_of_data() {
        let t = transfer();
        t.write(0, 0, b"hello").unwrap();
        let mut buf = [0u8; 5];
        let read = t.read(0, 0, &mut buf).unwrap();
        assert_eq!(read.copied, 5);
        assert!(!read.end_of_data);
    }

    #[test]
    fn test_mark_complete_bumps_generation() {
        let t = transfer();
        let rx = t.subscribe();
        t.mark_complete(1).unwrap();
        assert_eq!(*rx.borrow(), 1);
        assert!(t.is_complete(1).unwrap());
        t.mark_incomplete(1).unwrap();
        assert!(!t.is_complete(1).unwrap());
    }

    #[test]
    fn test_is_complete_does_not_create_entries() {
        let t = transfer();
        assert!(!t.is_complete(2).unwrap());
        assert_eq!(t.resident_pieces(), 0);
    }
}
