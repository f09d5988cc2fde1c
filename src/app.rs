//! App session and playback orchestration
//!
//! [`StreamApp`] owns everything one run needs: the transfer engine handle,
//! the in-memory transfer, the bridge and at most one playback session. Each
//! of those sits behind its own lock, so HTTP requests never wait on playback
//! control and vice versa.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::{release_priorities, PlaybackCoordinator};
use crate::engine::{got_metadata, EngineError, TransferEngine};
use crate::models::*;
use crate::player::{LaunchOptions, MpvPlayer, PlayerError, PlaylistItem, SessionEnd};
use crate::storage::{MemTransfer, MemoryStorage};
use crate::stream::{ServerError, StreamServer, VirtualFileSet};

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced to the caller by playback orchestration
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Player(#[from] PlayerError),
    #[error("No playable media files in transfer")]
    NoMedia,
    #[error("File index {index} out of range ({len} media files)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Nothing is playing")]
    NotPlaying,
}

// =============================================================================
// Playback Session
// =============================================================================

struct Session {
    player: Arc<MpvPlayer>,
    items: Vec<FileEntry>,
    started: Instant,
    coordinator: JoinHandle<SessionEnd>,
}

impl Session {
    async fn stop(self) -> SessionEnd {
        let end = self.player.stop().await;
        self.coordinator.abort();
        end
    }
}

// =============================================================================
// App
// =============================================================================

/// One transfer, its bridge and its playback session
pub struct StreamApp {
    engine: Arc<dyn TransferEngine>,
    transfer: Arc<MemTransfer>,
    layout: TransferLayout,
    media: Vec<FileEntry>,
    server: Arc<StreamServer>,
    server_task: JoinHandle<Result<(), ServerError>>,
    session: Mutex<Option<Session>>,
}

impl StreamApp {
    /// Wait for metadata, attach to the transfer's storage and start the bridge.
    pub async fn open(
        engine: Arc<dyn TransferEngine>,
        storage: &MemoryStorage,
        readahead_min: u64,
    ) -> Result<Self, PlaybackError> {
        let layout = got_metadata(engine.as_ref()).await?;
        let transfer = storage
            .get(&layout.id)
            .unwrap_or_else(|| storage.open_transfer(layout.clone()));

        let mut media: Vec<FileEntry> = layout
            .entries()
            .into_iter()
            .filter(FileEntry::is_media)
            .collect();
        media.sort_by(|a, b| a.path.cmp(&b.path));

        let server = Arc::new(StreamServer::bind_with_readahead(readahead_min).await?);
        let server_task = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve().await }
        });

        info!(
            transfer = %layout.id,
            files = layout.files.len(),
            media = media.len(),
            "transfer ready"
        );
        Ok(Self {
            engine,
            transfer,
            layout,
            media,
            server,
            server_task,
            session: Mutex::new(None),
        })
    }

    pub fn layout(&self) -> &TransferLayout {
        &self.layout
    }

    /// Every file of the transfer, in transfer order
    pub fn files(&self) -> Vec<FileEntry> {
        self.layout.entries()
    }

    /// Playable files sorted by path
    pub fn media_files(&self) -> &[FileEntry] {
        &self.media
    }

    pub fn server(&self) -> &StreamServer {
        &self.server
    }

    pub fn transfer(&self) -> &Arc<MemTransfer> {
        &self.transfer
    }

    /// Completed pieces over the pieces backing `entry`
    pub fn progress(&self, entry: &FileEntry) -> FileProgress {
        let completed = self.transfer.completed_in(entry.pieces()).unwrap_or(0);
        FileProgress::new(entry, completed)
    }

    /// Publish `items` on the bridge and return their URLs.
    pub fn publish(&self, items: Vec<FileEntry>) -> Result<Vec<String>, PlaybackError> {
        let count = items.len();
        self.server.publish(VirtualFileSet::new(
            Arc::clone(&self.transfer),
            Arc::clone(&self.engine),
            items,
        ));
        let urls = (0..count)
            .map(|index| self.server.build_url(index))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(urls)
    }

    /// Publish every media file without playing anything.
    pub fn publish_media(&self) -> Result<Vec<(FileEntry, String)>, PlaybackError> {
        if self.media.is_empty() {
            return Err(PlaybackError::NoMedia);
        }
        let urls = self.publish(self.media.clone())?;
        Ok(self.media.iter().cloned().zip(urls).collect())
    }

    /// Start playing media file `index`, alone or followed by the rest of the
    /// media files when `all` is set. Any running session is stopped first.
    ///
    /// A [`PlayerError::ConnectFailed`] leaves the new session registered with
    /// its player running but uncontrolled; [`StreamApp::stop`] ends it.
    pub async fn play(
        &self,
        index: usize,
        all: bool,
        options: LaunchOptions,
    ) -> Result<(), PlaybackError> {
        if self.media.is_empty() {
            return Err(PlaybackError::NoMedia);
        }
        if index >= self.media.len() {
            return Err(PlaybackError::IndexOutOfRange {
                index,
                len: self.media.len(),
            });
        }

        let previous = self.session.lock().take();
        if let Some(previous) = previous {
            info!("stopping previous playback session");
            previous.stop().await;
        }

        let (items, start) = if all {
            (self.media.clone(), index)
        } else {
            (vec![self.media[index].clone()], 0)
        };
        let urls = self.publish(items.clone())?;
        let playlist: Vec<PlaylistItem> = items
            .iter()
            .zip(urls)
            .map(|(entry, url)| PlaylistItem::new(url, entry.name.clone()))
            .collect();

        let mut coordinator = PlaybackCoordinator::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.transfer),
            items.clone(),
            start,
        );
        coordinator.apply_start();

        let (player, events) = match MpvPlayer::launch(playlist, start, options) {
            Ok(launched) => launched,
            Err(e) => {
                self.release_priorities();
                return Err(e.into());
            }
        };
        let player = Arc::new(player);
        let session = Session {
            player: Arc::clone(&player),
            items,
            started: Instant::now(),
            coordinator: tokio::spawn(coordinator.run(events)),
        };
        let replaced = self.session.lock().replace(session);
        if let Some(replaced) = replaced {
            warn!("another session started concurrently, stopping it");
            replaced.stop().await;
        }

        player.connect().await?;
        Ok(())
    }

    /// Stop the running session, if any.
    pub async fn stop(&self) -> Option<SessionEnd> {
        let session = self.session.lock().take()?;
        let end = session.stop().await;
        self.release_priorities();
        Some(end)
    }

    /// Wait for the running session's player to exit and release the session.
    pub async fn wait_ended(&self) -> Option<SessionEnd> {
        let player = self
            .session
            .lock()
            .as_ref()
            .map(|session| Arc::clone(&session.player))?;
        let end = player.wait().await;

        let finished = {
            let mut session = self.session.lock();
            if session
                .as_ref()
                .is_some_and(|s| Arc::ptr_eq(&s.player, &player))
            {
                session.take()
            } else {
                None
            }
        };
        if let Some(finished) = finished {
            // the coordinator stops on the exit event; let it apply what came before
            if let Err(e) = finished.coordinator.await {
                debug!("coordinator task ended abnormally: {}", e);
            }
            self.release_priorities();
        }
        Some(end)
    }

    fn release_priorities(&self) {
        debug!(transfer = %self.layout.id, "releasing fetch priorities");
        release_priorities(self.engine.as_ref(), &self.layout);
    }

    /// Override the title shown by the player for the current item.
    pub fn set_media_title(&self, title: &str) -> Result<(), PlaybackError> {
        let session = self.session.lock();
        let session = session.as_ref().ok_or(PlaybackError::NotPlaying)?;
        session.player.set_media_title(title)?;
        Ok(())
    }

    pub fn is_playing(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|s| s.player.state().is_running())
    }

    /// Snapshot for display
    pub fn status(&self) -> PlaybackStatus {
        let session = self.session.lock();
        let Some(session) = session.as_ref() else {
            return PlaybackStatus::idle();
        };
        let position = session.player.position();
        let current = session.items.get(position);
        PlaybackStatus {
            state: session.player.state(),
            position,
            playlist_len: session.items.len(),
            title: current.map(|entry| entry.name.clone()),
            progress: current.map(|entry| self.progress(entry)),
            elapsed_secs: session.started.elapsed().as_secs(),
        }
    }

    /// Stop playback and the bridge.
    pub async fn shutdown(self) {
        self.stop().await;
        self.server.shutdown();
        match self.server_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("stream server error: {}", e),
            Err(e) => warn!("stream server task failed: {}", e),
        }
    }
}
