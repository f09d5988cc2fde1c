//! Local-file transfer engine
//!
//! Presents a set of files on disk as one transfer and "fetches" its pieces
//! into the in-memory cache in priority order, one piece at a time. It stands
//! in for the swarm engine when developing and testing the pipeline, and obeys
//! the same rules: pieces at [`Priority::None`] are never fetched, evicted
//! pieces are fetched again only if something still wants them.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{EngineError, TransferEngine};
use crate::models::{FileInfo, Priority, TransferId, TransferLayout};
use crate::storage::{MemTransfer, MemoryStorage};

/// Default piece size for local transfers
pub const DEFAULT_PIECE_LENGTH: u64 = 1024 * 1024;

#[derive(Debug, Default)]
struct PriorityTable {
    pieces: HashMap<usize, Priority>,
    files: Vec<Priority>,
}

struct Inner {
    layout: TransferLayout,
    paths: Vec<PathBuf>,
    file_pieces: Vec<Range<usize>>,
    transfer: Arc<MemTransfer>,
    priorities: Mutex<PriorityTable>,
    failed: Mutex<HashSet<usize>>,
    wake: Notify,
    metadata: watch::Sender<Option<TransferLayout>>,
    fetch_delay: Duration,
}

/// Transfer engine over local files
pub struct LocalEngine {
    inner: Arc<Inner>,
    fetcher: JoinHandle<()>,
}

impl LocalEngine {
    /// Open `paths` as one transfer stored in `storage`.
    ///
    /// All files start at [`Priority::None`]; nothing is fetched until asked for.
    pub async fn open(
        paths: Vec<PathBuf>,
        piece_length: u64,
        storage: &MemoryStorage,
    ) -> Result<Self, EngineError> {
        Self::open_with_delay(paths, piece_length, storage, Duration::ZERO).await
    }

    /// Like [`LocalEngine::open`], sleeping `fetch_delay` before storing each piece.
    pub async fn open_with_delay(
        paths: Vec<PathBuf>,
        piece_length: u64,
        storage: &MemoryStorage,
        fetch_delay: Duration,
    ) -> Result<Self, EngineError> {
        if paths.is_empty() {
            return Err(EngineError::NoFiles);
        }

        let mut files = Vec::with_capacity(paths.len());
        for path in &paths {
            let meta = tokio::fs::metadata(path).await?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            files.push(FileInfo::new(name, meta.len()));
        }

        let name = match files.as_slice() {
            [single] => single.path.clone(),
            _ => paths[0]
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "local".to_string()),
        };

        let layout = TransferLayout {
            id: TransferId::new(format!("local-{}", Uuid::new_v4().simple())),
            name,
            piece_length: piece_length.max(1),
            files,
        };
        let file_pieces = (0..layout.files.len())
            .map(|i| layout.piece_range(i))
            .collect();
        let transfer = storage.open_transfer(layout.clone());

        info!(
            transfer = %layout.id,
            files = layout.files.len(),
            pieces = layout.piece_count(),
            "opened local transfer"
        );

        let (metadata, _) = watch::channel(Some(layout.clone()));
        let inner = Arc::new(Inner {
            priorities: Mutex::new(PriorityTable {
                pieces: HashMap::new(),
                files: vec![Priority::None; layout.files.len()],
            }),
            layout,
            paths,
            file_pieces,
            transfer,
            failed: Mutex::new(HashSet::new()),
            wake: Notify::new(),
            metadata,
            fetch_delay,
        });

        let fetcher = tokio::spawn(fetch_loop(Arc::clone(&inner)));
        Ok(Self { inner, fetcher })
    }

    pub fn layout(&self) -> &TransferLayout {
        &self.inner.layout
    }

    /// Cache the engine writes into
    pub fn transfer(&self) -> Arc<MemTransfer> {
        Arc::clone(&self.inner.transfer)
    }

    /// Effective priority of `piece`: the highest of its own and its files'.
    pub fn piece_priority(&self, piece: usize) -> Priority {
        self.inner.effective_priority(piece, &self.inner.priorities.lock())
    }
}

impl Drop for LocalEngine {
    fn drop(&mut self) {
        self.fetcher.abort();
    }
}

impl TransferEngine for LocalEngine {
    fn metadata(&self) -> watch::Receiver<Option<TransferLayout>> {
        self.inner.metadata.subscribe()
    }

    fn set_piece_priority(&self, piece: usize, priority: Priority) {
        {
            let mut table = self.inner.priorities.lock();
            if priority == Priority::None {
                table.pieces.remove(&piece);
            } else {
                table.pieces.insert(piece, priority);
            }
        }
        self.inner.wake.notify_one();
    }

    fn set_file_priority(&self, file: usize, priority: Priority) {
        {
            let mut table = self.inner.priorities.lock();
            if let Some(slot) = table.files.get_mut(file) {
                *slot = priority;
            }
        }
        self.inner.wake.notify_one();
    }

    fn set_piece_range_priority(&self, pieces: Range<usize>, priority: Priority) {
        {
            let mut table = self.inner.priorities.lock();
            for piece in pieces {
                if priority == Priority::None {
                    table.pieces.remove(&piece);
                } else {
                    table.pieces.insert(piece, priority);
                }
            }
        }
        self.inner.wake.notify_one();
    }
}

impl Inner {
    fn effective_priority(&self, piece: usize, table: &PriorityTable) -> Priority {
        let own = table.pieces.get(&piece).copied().unwrap_or_default();
        self.file_pieces
            .iter()
            .zip(&table.files)
            .filter(|(range, _)| range.contains(&piece))
            .map(|(_, priority)| *priority)
            .fold(own, Priority::max)
    }

    /// Highest-priority piece that is wanted and not yet in memory; lowest index wins ties.
    fn next_piece(&self) -> Option<usize> {
        let table = self.priorities.lock();
        let failed = self.failed.lock();
        let mut best: Option<(Priority, usize)> = None;
        for piece in 0..self.layout.piece_count() {
            let priority = self.effective_priority(piece, &table);
            if priority == Priority::None || failed.contains(&piece) {
                continue;
            }
            if best.is_some_and(|(p, _)| p >= priority) {
                continue;
            }
            if self.transfer.is_complete(piece).unwrap_or(true) {
                continue;
            }
            best = Some((priority, piece));
        }
        best.map(|(_, piece)| piece)
    }

    async fn fetch(&self, piece: usize) -> Result<(), EngineError> {
        let piece_begin = piece as u64 * self.layout.piece_length;
        let piece_end = piece_begin + self.layout.piece_size(piece);
        let mut data = Vec::with_capacity((piece_end - piece_begin) as usize);

        let mut file_begin = 0u64;
        for (info, path) in self.layout.files.iter().zip(&self.paths) {
            let file_end = file_begin + info.length;
            let begin = piece_begin.max(file_begin);
            let end = piece_end.min(file_end);
            if begin < end {
                let mut file = File::open(path).await?;
                file.seek(std::io::SeekFrom::Start(begin - file_begin)).await?;
                let start = data.len();
                data.resize(start + (end - begin) as usize, 0);
                file.read_exact(&mut data[start..]).await?;
            }
            file_begin = file_end;
        }

        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        self.store(piece, &data)
    }

    fn store(&self, piece: usize, data: &[u8]) -> Result<(), EngineError> {
        let entry = self
            .transfer
            .piece(piece)
            .map_err(|_| EngineError::Closed)?;
        entry.write_at(0, data);
        self.transfer
            .mark_complete(piece)
            .map_err(|_| EngineError::Closed)
    }
}

async fn fetch_loop(inner: Arc<Inner>) {
    loop {
        if inner.transfer.is_closed() {
            debug!(transfer = %inner.layout.id, "transfer closed, fetcher exiting");
            return;
        }
        let Some(piece) = inner.next_piece() else {
            inner.wake.notified().await;
            continue;
        };
        match inner.fetch(piece).await {
            Ok(()) => debug!(piece, "fetched piece"),
            Err(EngineError::Closed) => return,
            Err(e) => {
                warn!(piece, "failed to fetch piece: {}", e);
                inner.failed.lock().insert(piece);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::got_metadata;

    async fn engine_over(
        bytes: &[u8],
        piece_length: u64,
    ) -> (tempfile::TempDir, MemoryStorage, LocalEngine) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.mkv");
        std::fs::write(&path, bytes).unwrap();
        let storage = MemoryStorage::new();
        let engine = LocalEngine::open(vec![path], piece_length, &storage)
            .await
            .unwrap();
        (dir, storage, engine)
    }

    #[tokio::test]
    async fn test_metadata_ready_immediately() {
        let (_dir, _storage, engine) = engine_over(b"0123456789", 4).await;
        let layout = got_metadata(&engine).await.unwrap();
        assert_eq!(layout.piece_count(), 3);
        assert_eq!(layout.files[0].path, "movie.mkv");
    }

    #[tokio::test]
    async fn test_nothing_fetched_without_priority() {
        let (_dir, _storage, engine) = engine_over(b"0123456789", 4).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.transfer().resident_pieces(), 0);
    }

    #[tokio::test]
    async fn test_fetches_prioritized_piece() {
        let (_dir, _storage, engine) = engine_over(b"0123456789", 4).await;
        let transfer = engine.transfer();
        let mut rx = transfer.subscribe();
        engine.set_piece_priority(2, Priority::Immediate);
        rx.changed().await.unwrap();
        assert!(transfer.is_complete(2).unwrap());
        let mut buf = [0u8; 4];
        let read = transfer.read(2, 0, &mut buf).unwrap();
        assert_eq!(&buf[..read.copied], b"89");
        assert!(!transfer.is_complete(0).unwrap());
    }

    #[test]
    fn test_file_priority_covers_pieces() {
        let table = PriorityTable {
            pieces: HashMap::from([(0, Priority::Immediate)]),
            files: vec![Priority::Low],
        };
        let layout = TransferLayout {
            id: TransferId::new("x"),
            name: "x".to_string(),
            piece_length: 4,
            files: vec![FileInfo::new("a.mkv", 10)],
        };
        let inner = Inner {
            transfer: Arc::new(MemTransfer::new(layout.clone())),
            layout,
            paths: vec![],
            file_pieces: vec![0..3],
            priorities: Mutex::new(PriorityTable::default()),
            failed: Mutex::new(HashSet::new()),
            wake: Notify::new(),
            metadata: watch::channel(None).0,
            fetch_delay: Duration::ZERO,
        };
        assert_eq!(inner.effective_priority(0, &table), Priority::Immediate);
        assert_eq!(inner.effective_priority(1, &table), Priority::Low);
        assert_eq!(inner.effective_priority(5, &table), Priority::None);
    }
}
