//! End-to-end flow tests
//!
//! Local files -> LocalEngine -> piece cache -> HTTP bridge -> client, plus a
//! full playback session against a stand-in player on Unix.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use memstream::app::{PlaybackError, StreamApp};
use memstream::engine::{LocalEngine, TransferEngine};
use memstream::models::{PlayerState, Priority};
use memstream::storage::MemoryStorage;
use reqwest::header::RANGE;
use reqwest::StatusCode;

const PIECE: u64 = 256;
const TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Fixtures
// =============================================================================

fn bytes(seed: u64, length: u64) -> Vec<u8> {
    (0..length).map(|i| ((i * 13 + seed) % 251) as u8).collect()
}

/// Writes `files` into `dir` and returns their paths in the given order.
fn write_files(dir: &Path, files: &[(&str, u64)]) -> Vec<PathBuf> {
    files
        .iter()
        .enumerate()
        .map(|(i, (name, length))| {
            let path = dir.join(name);
            std::fs::write(&path, bytes(i as u64, *length)).unwrap();
            path
        })
        .collect()
}

async fn open_app(paths: Vec<PathBuf>, storage: &MemoryStorage) -> (StreamApp, Arc<LocalEngine>) {
    let engine = Arc::new(LocalEngine::open(paths, PIECE, storage).await.unwrap());
    let app = StreamApp::open(
        Arc::clone(&engine) as Arc<dyn TransferEngine>,
        storage,
        PIECE,
    )
    .await
    .unwrap();
    (app, engine)
}

// =============================================================================
// Streaming
// =============================================================================

#[tokio::test]
async fn test_stream_local_files_through_bridge() {
    let dir = tempfile::tempdir().unwrap();
    // transfer order differs from sorted order; notes.txt is not media
    let paths = write_files(
        dir.path(),
        &[("b.mkv", 3000), ("notes.txt", 100), ("a.mp4", 2100)],
    );
    let storage = MemoryStorage::new();
    let (app, _engine) = open_app(paths, &storage).await;

    let names: Vec<_> = app.media_files().iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["a.mp4", "b.mkv"]);
    assert_eq!(app.files().len(), 3);

    let published = app.publish_media().unwrap();
    assert_eq!(published.len(), 2);

    let client = reqwest::Client::new();
    let body = tokio::time::timeout(TIMEOUT, async {
        client.get(&published[1].1).send().await.unwrap().bytes().await.unwrap()
    })
    .await
    .expect("stream stalled");
    assert_eq!(body.as_ref(), bytes(0, 3000).as_slice());

    let resp = client
        .get(&published[0].1)
        .header(RANGE, "bytes=1000-1499")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    let body = tokio::time::timeout(TIMEOUT, resp.bytes())
        .await
        .expect("range stalled")
        .unwrap();
    assert_eq!(body.as_ref(), &bytes(2, 2100)[1000..1500]);

    let progress = app.progress(&published[1].0);
    assert!(progress.completed_pieces > 0);
    app.shutdown().await;
}

#[tokio::test]
async fn test_only_requested_pieces_are_fetched() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_files(dir.path(), &[("big.mkv", PIECE * 40)]);
    let storage = MemoryStorage::new();
    let (app, engine) = open_app(paths, &storage).await;
    let published = app.publish_media().unwrap();

    let resp = reqwest::Client::new()
        .get(&published[0].1)
        .header(RANGE, format!("bytes={}-{}", PIECE * 30, PIECE * 30 + 9))
        .send()
        .await
        .unwrap();
    let body = tokio::time::timeout(TIMEOUT, resp.bytes())
        .await
        .expect("range stalled")
        .unwrap();
    assert_eq!(body.len(), 10);

    // nothing before the requested range was wanted
    let transfer = engine.transfer();
    assert_eq!(transfer.completed_in(0..30).unwrap(), 0);
    assert!(transfer.is_complete(30).unwrap());
    app.shutdown().await;
}

// =============================================================================
// Errors
// =============================================================================

#[tokio::test]
async fn test_no_media_in_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_files(dir.path(), &[("readme.txt", 10)]);
    let storage = MemoryStorage::new();
    let (app, _engine) = open_app(paths, &storage).await;

    assert!(matches!(app.publish_media(), Err(PlaybackError::NoMedia)));
    let options = memstream::player::LaunchOptions::new("mpv");
    assert!(matches!(
        app.play(0, false, options).await,
        Err(PlaybackError::NoMedia)
    ));
    app.shutdown().await;
}

#[tokio::test]
async fn test_play_index_out_of_range() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_files(dir.path(), &[("a.mkv", 10), ("b.mkv", 10)]);
    let storage = MemoryStorage::new();
    let (app, _engine) = open_app(paths, &storage).await;

    let options = memstream::player::LaunchOptions::new("mpv");
    assert!(matches!(
        app.play(2, true, options).await,
        Err(PlaybackError::IndexOutOfRange { index: 2, len: 2 })
    ));
    assert!(!app.is_playing());
    assert_eq!(app.status().state, PlayerState::Idle);
    assert!(matches!(
        app.set_media_title("x"),
        Err(PlaybackError::NotPlaying)
    ));
    app.shutdown().await;
}

#[tokio::test]
async fn test_failed_launch_releases_priorities() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_files(dir.path(), &[("a.mkv", PIECE * 4), ("b.mkv", PIECE * 4)]);
    let storage = MemoryStorage::new();
    let (app, engine) = open_app(paths, &storage).await;

    let options = memstream::player::LaunchOptions::new("/nonexistent/memstream/mpv");
    let err = app.play(1, true, options).await.unwrap_err();
    assert!(matches!(
        err,
        PlaybackError::Player(memstream::player::PlayerError::NotFound(_))
    ));
    assert!(!app.is_playing());
    for piece in 0..8 {
        assert_eq!(engine.piece_priority(piece), Priority::None, "piece {}", piece);
    }
    app.shutdown().await;
}

// =============================================================================
// Playback Sessions
// =============================================================================

#[cfg(unix)]
mod playback {
    use super::*;
    use memstream::player::{ControlEndpoint, LaunchOptions, PlayerError, SessionEnd};
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    fn stand_in(dir: &Path, script: &str) -> (LaunchOptions, ControlEndpoint) {
        let endpoint = ControlEndpoint::at(dir.join("mpv.sock"));
        let options = LaunchOptions::new("sh")
            .with_prefix_args(["-c", script, "mpv"])
            .with_endpoint(endpoint.clone())
            .with_connect(100, Duration::from_millis(20))
            .with_quit_grace(Duration::from_millis(200));
        (options, endpoint)
    }

    #[tokio::test]
    async fn test_advancing_playlist_releases_watched_file() {
        let dir = tempfile::tempdir().unwrap();
        let media = tempfile::tempdir().unwrap();
        let paths = write_files(media.path(), &[("e1.mkv", PIECE * 8), ("e2.mkv", PIECE * 8)]);
        let storage = MemoryStorage::new();
        let (app, engine) = open_app(paths, &storage).await;
        let (options, endpoint) = stand_in(dir.path(), "exec sleep 30");

        // pull all of e1 into memory first
        let published = app.publish_media().unwrap();
        let e1 = tokio::time::timeout(TIMEOUT, async {
            reqwest::get(&published[0].1).await.unwrap().bytes().await.unwrap()
        })
        .await
        .expect("e1 stalled");
        assert_eq!(e1.len() as u64, PIECE * 8);
        let transfer = engine.transfer();
        assert_eq!(transfer.completed_in(0..8).unwrap(), 8);

        let player_side = async {
            let listener = UnixListener::bind(endpoint.path()).unwrap();
            let (stream, _) = tokio::time::timeout(TIMEOUT, listener.accept())
                .await
                .expect("player never connected")
                .unwrap();
            stream
        };
        let (played, stream) = tokio::join!(app.play(0, true, options), player_side);
        played.unwrap();
        assert!(app.is_playing());

        let status = app.status();
        assert_eq!(status.state, PlayerState::Active);
        assert_eq!(status.playlist_len, 2);
        assert_eq!(status.title.as_deref(), Some("e1.mkv"));

        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let first = lines.next_line().await.unwrap().unwrap();
        let first: Value = serde_json::from_str(&first).unwrap();
        assert_eq!(first["command"][0], "loadfile");
        assert_eq!(first["command"][2], "append");

        write
            .write_all(
                format!(
                    "{}\n",
                    json!({"event": "property-change", "id": 1, "name": "playlist-pos", "data": 1})
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let mut released = false;
        for _ in 0..250 {
            if transfer.completed_in(0..8).unwrap() == 0 {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(released, "watched file still in memory");
        assert_eq!(app.status().position, 1);
        assert_eq!(app.status().title.as_deref(), Some("e2.mkv"));

        let end = app.stop().await.unwrap();
        assert_eq!(end, SessionEnd::Exited { code: None });
        assert!(!app.is_playing());
        assert!(!endpoint.exists());
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_new_session_releases_previous_files() {
        let dir = tempfile::tempdir().unwrap();
        let media = tempfile::tempdir().unwrap();
        let paths = write_files(
            media.path(),
            &[("a.mkv", PIECE * 4), ("b.mkv", PIECE * 4), ("c.mkv", PIECE * 4)],
        );
        let storage = MemoryStorage::new();
        let (app, engine) = open_app(paths, &storage).await;
        let (options, _) = stand_in(dir.path(), "exec sleep 30");
        let options = options.with_connect(3, Duration::from_millis(10));

        // the stand-in never opens the endpoint, so both sessions run uncontrolled
        let err = app.play(0, true, options.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            PlaybackError::Player(PlayerError::ConnectFailed { .. })
        ));
        assert_eq!(engine.piece_priority(0), Priority::Immediate);
        assert_eq!(engine.piece_priority(1), Priority::Normal);
        assert_eq!(engine.piece_priority(4), Priority::Low);
        assert_eq!(engine.piece_priority(8), Priority::Low);

        let err = app.play(2, false, options).await.unwrap_err();
        assert!(matches!(
            err,
            PlaybackError::Player(PlayerError::ConnectFailed { .. })
        ));
        assert_eq!(app.status().playlist_len, 1);
        for piece in 0..8 {
            assert_eq!(engine.piece_priority(piece), Priority::None, "piece {}", piece);
        }
        assert_eq!(engine.piece_priority(8), Priority::Immediate);
        assert_eq!(engine.piece_priority(9), Priority::Normal);

        app.stop().await.unwrap();
        for piece in 0..12 {
            assert_eq!(engine.piece_priority(piece), Priority::None, "piece {}", piece);
        }
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_uncontrolled_session_still_ends() {
        let dir = tempfile::tempdir().unwrap();
        let media = tempfile::tempdir().unwrap();
        let paths = write_files(media.path(), &[("movie.mkv", PIECE * 2)]);
        let storage = MemoryStorage::new();
        let (app, _engine) = open_app(paths, &storage).await;
        let (options, _) = stand_in(dir.path(), "sleep 0.3; exit 0");
        let options = options.with_connect(3, Duration::from_millis(10));

        let err = app.play(0, false, options).await.unwrap_err();
        assert!(matches!(
            err,
            PlaybackError::Player(PlayerError::ConnectFailed { .. })
        ));
        assert!(app.is_playing());

        let end = tokio::time::timeout(TIMEOUT, app.wait_ended())
            .await
            .expect("player never exited")
            .unwrap();
        assert!(end.is_clean());
        assert!(!app.is_playing());
        assert!(app.wait_ended().await.is_none());
        app.shutdown().await;
    }
}
