//! Playlist-driven priority and eviction tests

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use memstream::coordinator::{PlaybackCoordinator, Transition};
use memstream::engine::TransferEngine;
use memstream::models::{FileEntry, FileInfo, Priority, TransferId, TransferLayout};
use memstream::player::{PlayerEvent, SessionEnd};
use memstream::storage::MemTransfer;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    File(usize, Priority),
    Pieces(Range<usize>, Priority),
}

#[derive(Default)]
struct Recorder(Mutex<Vec<Call>>);

impl Recorder {
    fn take(&self) -> Vec<Call> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl TransferEngine for Recorder {
    fn metadata(&self) -> watch::Receiver<Option<TransferLayout>> {
        watch::channel(None).1
    }

    fn set_piece_priority(&self, piece: usize, priority: Priority) {
        self.0.lock().push(Call::Pieces(piece..piece + 1, priority));
    }

    fn set_file_priority(&self, file: usize, priority: Priority) {
        self.0.lock().push(Call::File(file, priority));
    }

    fn set_piece_range_priority(&self, pieces: Range<usize>, priority: Priority) {
        self.0.lock().push(Call::Pieces(pieces, priority));
    }
}

/// Three 100-byte episodes in pieces of 10, every piece resident
fn setup() -> (Arc<Recorder>, Arc<MemTransfer>, Vec<FileEntry>) {
    let layout = TransferLayout {
        id: TransferId::new("season"),
        name: "season".to_string(),
        piece_length: 10,
        files: (0..3)
            .map(|i| FileInfo::new(format!("s01e0{}.mkv", i + 1), 100))
            .collect(),
    };
    let entries = layout.entries();
    let transfer = Arc::new(MemTransfer::new(layout));
    for piece in 0..30 {
        transfer.write(piece, 0, &[1u8; 10]).unwrap();
        transfer.mark_complete(piece).unwrap();
    }
    (Arc::new(Recorder::default()), transfer, entries)
}

fn coordinator(
    engine: &Arc<Recorder>,
    transfer: &Arc<MemTransfer>,
    entries: &[FileEntry],
    start: usize,
) -> PlaybackCoordinator {
    PlaybackCoordinator::new(
        Arc::clone(engine) as Arc<dyn TransferEngine>,
        Arc::clone(transfer),
        entries.to_vec(),
        start,
    )
}

#[test]
fn test_advance_evicts_previous_item_once() {
    let (engine, transfer, entries) = setup();
    let mut c = coordinator(&engine, &transfer, &entries, 0);
    c.apply_start();
    engine.take();

    let t = c.on_position(1).unwrap();
    assert_eq!(
        t,
        Transition {
            from: 0,
            to: 1,
            evicted: vec![0]
        }
    );
    assert_eq!(transfer.completed_in(0..10).unwrap(), 0);
    assert_eq!(transfer.completed_in(10..30).unwrap(), 20);

    let calls = engine.take();
    assert_eq!(calls[0], Call::File(0, Priority::None));
    assert_eq!(calls[1], Call::Pieces(0..10, Priority::None));
    assert!(calls.contains(&Call::File(1, Priority::Normal)));
    assert!(calls.contains(&Call::File(2, Priority::Low)));
    assert!(calls.contains(&Call::Pieces(10..11, Priority::Immediate)));

    // repeated notification is a no-op
    assert_eq!(c.on_position(1), None);
    assert!(engine.take().is_empty());
}

#[test]
fn test_skip_ahead_evicts_every_passed_item() {
    let (engine, transfer, entries) = setup();
    let mut c = coordinator(&engine, &transfer, &entries, 0);

    let t = c.on_position(2).unwrap();
    assert_eq!(t.evicted, vec![0, 1]);
    assert!(c.is_evicted(0) && c.is_evicted(1));
    assert_eq!(transfer.resident_pieces(), 10);
}

#[test]
fn test_start_in_middle_keeps_earlier_items() {
    let (engine, transfer, entries) = setup();
    let mut c = coordinator(&engine, &transfer, &entries, 1);
    c.apply_start();

    let calls = engine.take();
    assert_eq!(
        calls,
        vec![
            Call::File(0, Priority::None),
            Call::File(1, Priority::None),
            Call::File(2, Priority::None),
            Call::Pieces(0..30, Priority::None),
            Call::File(0, Priority::Low),
            Call::File(1, Priority::Normal),
            Call::File(2, Priority::Low),
            Call::Pieces(10..11, Priority::Immediate),
        ]
    );
    assert_eq!(transfer.resident_pieces(), 30);
}

#[test]
fn test_going_back_restores_evicted_item() {
    let (engine, transfer, entries) = setup();
    let mut c = coordinator(&engine, &transfer, &entries, 0);
    c.on_position(1).unwrap();
    engine.take();

    let t = c.on_position(0).unwrap();
    assert!(t.evicted.is_empty());
    assert!(!c.is_evicted(0));
    let calls = engine.take();
    assert!(calls.contains(&Call::File(0, Priority::Normal)));
    assert!(calls.contains(&Call::File(1, Priority::Low)));
    assert!(calls.contains(&Call::Pieces(0..1, Priority::Immediate)));
    assert_eq!(transfer.completed_in(10..20).unwrap(), 10);
}

#[test]
fn test_second_session_drops_files_outside_playlist() {
    let (engine, transfer, entries) = setup();
    let mut first = coordinator(&engine, &transfer, &entries, 0);
    first.apply_start();
    engine.take();

    let mut second = coordinator(&engine, &transfer, &entries[2..], 0);
    second.apply_start();
    let calls = engine.take();
    // the first session's boost on piece 0 and its low files are cleared
    assert_eq!(
        &calls[..4],
        &[
            Call::File(0, Priority::None),
            Call::File(1, Priority::None),
            Call::File(2, Priority::None),
            Call::Pieces(0..30, Priority::None),
        ]
    );
    assert_eq!(
        &calls[4..],
        &[
            Call::File(2, Priority::Normal),
            Call::Pieces(20..21, Priority::Immediate),
        ]
    );
}

#[test]
fn test_leaving_item_clears_its_boost() {
    let (engine, transfer, entries) = setup();
    let mut c = coordinator(&engine, &transfer, &entries, 2);
    c.apply_start();
    engine.take();

    c.on_position(1).unwrap();
    let calls = engine.take();
    assert_eq!(calls[0], Call::Pieces(20..21, Priority::None));
    assert!(calls.contains(&Call::File(2, Priority::Low)));
    assert!(calls.contains(&Call::Pieces(10..11, Priority::Immediate)));
}

#[tokio::test]
async fn test_run_follows_events_until_end() {
    let (engine, transfer, entries) = setup();
    let c = coordinator(&engine, &transfer, &entries, 0);
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(c.run(rx));

    tx.send(PlayerEvent::PlaylistPos(1)).unwrap();
    tx.send(PlayerEvent::PlaylistPos(1)).unwrap();
    tx.send(PlayerEvent::Ended(SessionEnd::Exited { code: Some(0) }))
        .unwrap();

    let end = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("coordinator did not stop")
        .unwrap();
    assert!(end.is_clean());
    assert_eq!(transfer.completed_in(0..10).unwrap(), 0);
    let evictions = engine
        .take()
        .into_iter()
        .filter(|call| *call == Call::Pieces(0..10, Priority::None))
        .count();
    assert_eq!(evictions, 1);
}

#[tokio::test]
async fn test_run_ends_when_channel_closes() {
    let (engine, transfer, entries) = setup();
    let c = coordinator(&engine, &transfer, &entries, 0);
    let (tx, rx) = mpsc::unbounded_channel();
    drop(tx);
    let end = c.run(rx).await;
    assert!(matches!(end, SessionEnd::WaitFailed(_)));
}
