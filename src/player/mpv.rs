//! mpv process control
//!
//! One [`MpvPlayer`] is one playback session:
//!
//! ```text
//! Idle -> Launching -> Connecting -> Active -> Terminating -> Idle
//! ```
//!
//! [`MpvPlayer::launch`] spawns the process with the control endpoint and the
//! first playlist item on its command line. [`MpvPlayer::connect`] polls the
//! endpoint until the player has created it, appends the rest of the playlist,
//! jumps to the start item and starts the background reader. [`MpvPlayer::stop`] asks the player to quit,
//! kills it after the grace period and removes the endpoint.
//!
//! Events (position changes, process exit) go out on an unbounded channel so
//! the reader never waits on whoever consumes them.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::endpoint::ControlEndpoint;
use super::protocol::{parse_line, Command, Event};
use super::{PlayerError, PlayerEvent, PlaylistItem, SessionEnd};
use crate::models::PlayerState;

/// How to start and talk to the player
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub program: PathBuf,
    /// Arguments placed before the player arguments
    pub prefix_args: Vec<String>,
    /// Fixed endpoint; a fresh per-session one when `None`
    pub endpoint: Option<ControlEndpoint>,
    pub connect_attempts: u32,
    pub connect_interval: Duration,
    /// Wait after `quit` before killing
    pub quit_grace: Duration,
}

impl LaunchOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            endpoint: None,
            connect_attempts: 50,
            connect_interval: Duration::from_millis(100),
            quit_grace: Duration::from_millis(500),
        }
    }

    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_endpoint(mut self, endpoint: ControlEndpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_connect(mut self, attempts: u32, interval: Duration) -> Self {
        self.connect_attempts = attempts.max(1);
        self.connect_interval = interval;
        self
    }

    pub fn with_quit_grace(mut self, grace: Duration) -> Self {
        self.quit_grace = grace;
        self
    }
}

/// Command line for the player: control endpoint plus the first item.
pub fn player_args(endpoint: &ControlEndpoint, playlist: &[PlaylistItem]) -> Vec<String> {
    let mut args = vec![
        "--no-terminal".to_string(),
        "--force-seekable=yes".to_string(),
        format!("--input-ipc-server={}", endpoint.as_arg()),
    ];
    if let [single] = playlist {
        if !single.title.is_empty() {
            args.push(format!("--force-media-title={}", single.title));
        }
    }
    if let Some(item) = playlist.first() {
        args.push(item.url.clone());
    }
    args
}

/// A running player process and its control channel
pub struct MpvPlayer {
    options: LaunchOptions,
    endpoint: ControlEndpoint,
    pid: Option<u32>,
    playlist: Vec<PlaylistItem>,
    start: usize,
    state: Arc<watch::Sender<PlayerState>>,
    position: Arc<AtomicUsize>,
    request_id: AtomicU64,
    commands: Mutex<Option<mpsc::UnboundedSender<String>>>,
    events: mpsc::UnboundedSender<PlayerEvent>,
    exit: watch::Receiver<Option<SessionEnd>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    // Control channel reader and writer; the process watcher is never aborted
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MpvPlayer {
    /// Spawn the player for `playlist`, starting at `start`.
    ///
    /// Returns in `Connecting`; call [`MpvPlayer::connect`] next. The receiver
    /// yields position changes and, last, the process exit.
    pub fn launch(
        playlist: Vec<PlaylistItem>,
        start: usize,
        options: LaunchOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PlayerEvent>), PlayerError> {
        if playlist.is_empty() {
            return Err(PlayerError::EmptyPlaylist);
        }
        if start >= playlist.len() {
            return Err(PlayerError::StartOutOfRange {
                start,
                len: playlist.len(),
            });
        }

        let endpoint = options
            .endpoint
            .clone()
            .unwrap_or_else(ControlEndpoint::for_session);
        endpoint.pre_clean();

        let state = Arc::new(watch::channel(PlayerState::Launching).0);
        let mut cmd = tokio::process::Command::new(&options.program);
        cmd.args(&options.prefix_args)
            .args(player_args(&endpoint, &playlist))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PlayerError::NotFound(options.program.display().to_string())
            } else {
                PlayerError::StartFailed(e)
            }
        })?;
        let pid = child.id();
        info!(
            program = %options.program.display(),
            pid,
            endpoint = %endpoint,
            items = playlist.len(),
            start,
            "launched player"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(watch_process(
            child,
            kill_rx,
            exit_tx,
            events_tx.clone(),
            endpoint.clone(),
            Arc::clone(&state),
        ));
        advance(&state, PlayerState::Launching, PlayerState::Connecting);

        let player = Self {
            options,
            endpoint,
            pid,
            position: Arc::new(AtomicUsize::new(start)),
            playlist,
            start,
            state,
            request_id: AtomicU64::new(0),
            commands: Mutex::new(None),
            events: events_tx,
            exit: exit_rx,
            kill: Mutex::new(Some(kill_tx)),
            tasks: Mutex::new(Vec::new()),
        };
        Ok((player, events_rx))
    }

    /// Poll the control endpoint until it accepts, then load the playlist.
    ///
    /// On failure the process is left running; [`MpvPlayer::stop`] still works.
    pub async fn connect(&self) -> Result<(), PlayerError> {
        let state = self.state();
        if state != PlayerState::Connecting {
            return Err(PlayerError::InvalidState {
                action: "connect",
                state,
            });
        }

        for attempt in 1..=self.options.connect_attempts {
            tokio::time::sleep(self.options.connect_interval).await;
            if self.exit_status().is_some() {
                debug!("player exited while connecting");
                break;
            }
            match self.endpoint.dial().await {
                Ok(stream) => {
                    debug!(attempt, endpoint = %self.endpoint, "connected to player");
                    self.attach(stream);
                    self.load_playlist();
                    advance(&self.state, PlayerState::Connecting, PlayerState::Active);
                    return Ok(());
                }
                Err(e) => trace!(attempt, "control endpoint not ready: {}", e),
            }
        }

        warn!(endpoint = %self.endpoint, "player control endpoint never came up");
        Err(PlayerError::ConnectFailed {
            endpoint: self.endpoint.to_string(),
            attempts: self.options.connect_attempts,
        })
    }

    fn attach<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.commands.lock() = Some(tx);

        let writer = tokio::spawn(write_commands(write, rx));
        let reader = tokio::spawn(read_events(
            read,
            self.events.clone(),
            Arc::clone(&self.position),
        ));
        self.tasks.lock().extend([writer, reader]);
    }

    /// Append the items after the first, title them, jump to the start item
    /// and observe position changes. Plain appends keep playlist indices equal
    /// to ours on every player version.
    fn load_playlist(&self) {
        for item in self.playlist.iter().skip(1) {
            self.command(Command::append(&item.url));
        }
        if self.playlist.len() > 1 {
            for (index, item) in self.playlist.iter().enumerate() {
                if !item.title.is_empty() {
                    self.command(Command::set_item_title(index, &item.title));
                }
            }
        }
        if self.start != 0 {
            self.command(Command::set_playlist_pos(self.start));
        }
        self.command(Command::observe_playlist_pos());
    }

    /// Send `command`; returns its request id.
    pub fn send(&self, command: Command) -> Result<u64, PlayerError> {
        let commands = self.commands.lock();
        let tx = commands.as_ref().ok_or(PlayerError::NotConnected)?;
        let id = self.request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let line = command.encode(id)?;
        tx.send(line).map_err(|_| PlayerError::NotConnected)?;
        trace!(id, verb = command.verb(), "sent player command");
        Ok(id)
    }

    // Failures after connect leave the session playing but uncontrolled
    fn command(&self, command: Command) {
        let verb = command.verb();
        if let Err(e) = self.send(command) {
            warn!("player command {} failed: {}", verb, e);
        }
    }

    pub fn set_media_title(&self, title: &str) -> Result<u64, PlayerError> {
        self.send(Command::set_media_title(title))
    }

    pub fn set_playlist_pos(&self, index: usize) -> Result<u64, PlayerError> {
        self.send(Command::set_playlist_pos(index))
    }

    pub fn state(&self) -> PlayerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlayerState> {
        self.state.subscribe()
    }

    /// Last playlist position reported by the player
    pub fn position(&self) -> usize {
        self.position.load(Ordering::SeqCst)
    }

    pub fn playlist(&self) -> &[PlaylistItem] {
        &self.playlist
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn endpoint(&self) -> &ControlEndpoint {
        &self.endpoint
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_connected(&self) -> bool {
        self.commands
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// How the process ended, once it has
    pub fn exit_status(&self) -> Option<SessionEnd> {
        self.exit.borrow().clone()
    }

    /// Wait for the process to end.
    pub async fn wait(&self) -> SessionEnd {
        let mut exit = self.exit.clone();
        let ended = exit.wait_for(Option::is_some).await;
        match ended {
            Ok(end) => end.clone().unwrap_or(SessionEnd::WaitFailed("no exit status".into())),
            Err(_) => SessionEnd::WaitFailed("process watcher stopped".into()),
        }
    }

    /// Kill the process without asking.
    pub fn kill(&self) {
        if let Some(kill) = self.kill.lock().take() {
            let _ = kill.send(());
        }
    }

    /// End the session: `quit`, then kill after the grace period. The control
    /// endpoint is gone when this returns.
    pub async fn stop(&self) -> SessionEnd {
        if self.exit_status().is_none() {
            self.state.send_replace(PlayerState::Terminating);
            let asked = self.is_connected() && self.send(Command::Quit).is_ok();
            let graceful = asked
                && tokio::time::timeout(self.options.quit_grace, self.wait())
                    .await
                    .is_ok();
            if !graceful {
                if asked {
                    warn!(grace = ?self.options.quit_grace, "player ignored quit, killing");
                }
                self.kill();
            }
        }

        let end = self.wait().await;
        self.shutdown_tasks();
        self.endpoint.post_clean();
        self.state.send_replace(PlayerState::Idle);
        info!("player stopped: {}", end);
        end
    }

    fn shutdown_tasks(&self) {
        *self.commands.lock() = None;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for MpvPlayer {
    fn drop(&mut self) {
        self.kill();
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

// The process watcher may have moved the state to Idle in the meantime
fn advance(state: &watch::Sender<PlayerState>, from: PlayerState, to: PlayerState) {
    state.send_if_modified(|current| {
        if *current == from {
            *current = to;
            true
        } else {
            false
        }
    });
}

// =============================================================================
// Background tasks
// =============================================================================

async fn watch_process(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    exit: watch::Sender<Option<SessionEnd>>,
    events: mpsc::UnboundedSender<PlayerEvent>,
    endpoint: ControlEndpoint,
    state: Arc<watch::Sender<PlayerState>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            if let Err(e) = child.start_kill() {
                warn!("failed to kill player: {}", e);
            }
            child.wait().await
        }
    };
    let end = match status {
        Ok(status) => SessionEnd::Exited {
            code: status.code(),
        },
        Err(e) => SessionEnd::WaitFailed(e.to_string()),
    };
    debug!("player process ended: {}", end);

    endpoint.post_clean();
    state.send_replace(PlayerState::Idle);
    exit.send_replace(Some(end.clone()));
    let _ = events.send(PlayerEvent::Ended(end));
}

async fn write_commands<W>(mut write: W, mut lines: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        if let Err(e) = write.write_all(line.as_bytes()).await {
            warn!("player control channel write failed: {}", e);
            return;
        }
    }
}

async fn read_events<R>(
    read: R,
    events: mpsc::UnboundedSender<PlayerEvent>,
    position: Arc<AtomicUsize>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(read).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_line(&line) {
                Some(Event::PlaylistPos(pos)) => {
                    position.store(pos, Ordering::SeqCst);
                    if events.send(PlayerEvent::PlaylistPos(pos)).is_err() {
                        debug!("no one listening for player events");
                    }
                }
                Some(Event::Reply {
                    request_id,
                    error: Some(error),
                }) => warn!(request_id, "player rejected command: {}", error),
                Some(event) => trace!(?event, "player message"),
                None => trace!(line = %line, "ignored player line"),
            },
            Ok(None) => {
                debug!("player control channel closed");
                return;
            }
            Err(e) => {
                warn!("player control channel read failed: {}", e);
                return;
            }
        }
    }
}
