//! External player control
//!
//! - Protocol: typed mpv JSON IPC commands and events
//! - Endpoint: per-session Unix socket / Windows named pipe
//! - Locate: player binary lookup
//! - Mpv: process lifecycle and playlist control

pub mod endpoint;
pub mod locate;
pub mod mpv;
pub mod protocol;

use thiserror::Error;

use crate::models::PlayerState;

pub use endpoint::ControlEndpoint;
pub use locate::{locate_player, MPV_PATH_ENV};
pub use mpv::{LaunchOptions, MpvPlayer};
pub use protocol::{Command, Event};

/// Errors from player operations
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("Player '{0}' not found. Install mpv, set MPV_PATH, or run `memstream config --mpv-path <PATH>`.")]
    NotFound(String),
    #[error("Failed to start player: {0}")]
    StartFailed(#[from] std::io::Error),
    #[error("Player control endpoint {endpoint} did not come up after {attempts} attempts")]
    ConnectFailed { endpoint: String, attempts: u32 },
    #[error("Player control channel is not connected")]
    NotConnected,
    #[error("Failed to encode player command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Cannot {action} while player is {state}")]
    InvalidState {
        action: &'static str,
        state: PlayerState,
    },
    #[error("Playlist is empty")]
    EmptyPlaylist,
    #[error("Start index {start} out of range for {len} items")]
    StartOutOfRange { start: usize, len: usize },
}

/// One playlist entry handed to the player
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistItem {
    pub url: String,
    pub title: String,
}

impl PlaylistItem {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
        }
    }
}

/// How the player process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The process exited; `code` is `None` when killed by a signal
    Exited { code: Option<i32> },
    /// Waiting on the process failed
    WaitFailed(String),
}

impl SessionEnd {
    pub fn is_clean(&self) -> bool {
        matches!(self, SessionEnd::Exited { code: Some(0) })
    }
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEnd::Exited { code: Some(code) } => write!(f, "exited with status {}", code),
            SessionEnd::Exited { code: None } => write!(f, "terminated by signal"),
            SessionEnd::WaitFailed(e) => write!(f, "wait failed: {}", e),
        }
    }
}

/// Notifications from a running player session, delivered in emission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    PlaylistPos(usize),
    Ended(SessionEnd),
}
