//! Data structures and types for memstream
//!
//! Contains all shared models used across the crate organized by domain:
//! - **Transfer**: transfer identity, piece layout and fetch priorities
//! - **Files**: the playable entries exposed to the bridge and the UI layer
//! - **Playback**: player state machine and status snapshots

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

// =============================================================================
// Transfer Models
// =============================================================================

/// Identifier of one transfer (an info hash for swarm transfers)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fetch priority understood by the transfer engine.
///
/// Ordered from "do not fetch" to "fetch right now"; when a piece is covered by
/// several requests the highest one wins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    None,
    Low,
    Normal,
    Immediate,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::None => write!(f, "none"),
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::Immediate => write!(f, "immediate"),
        }
    }
}

/// One file inside a transfer, in transfer order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Path inside the transfer, `/`-separated
    pub path: String,
    pub length: u64,
}

impl FileInfo {
    pub fn new(path: impl Into<String>, length: u64) -> Self {
        Self {
            path: path.into(),
            length,
        }
    }
}

/// Piece geometry and file table of a transfer, valid once metadata arrived.
///
/// Files are laid end to end; pieces are `piece_length` bytes except the last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLayout {
    pub id: TransferId,
    pub name: String,
    pub piece_length: u64,
    pub files: Vec<FileInfo>,
}

impl TransferLayout {
    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn piece_count(&self) -> usize {
        if self.piece_length == 0 {
            return 0;
        }
        self.total_length().div_ceil(self.piece_length) as usize
    }

    /// Declared size of piece `index`; the last piece may be short.
    pub fn piece_size(&self, index: usize) -> u64 {
        let begin = index as u64 * self.piece_length;
        let total = self.total_length();
        if begin >= total {
            return 0;
        }
        self.piece_length.min(total - begin)
    }

    /// Byte offset of file `index` inside the concatenated transfer.
    pub fn file_offset(&self, index: usize) -> u64 {
        self.files.iter().take(index).map(|f| f.length).sum()
    }

    /// Contiguous `[begin, end)` piece indices backing file `index`.
    pub fn piece_range(&self, index: usize) -> Range<usize> {
        let Some(file) = self.files.get(index) else {
            return 0..0;
        };
        if self.piece_length == 0 {
            return 0..0;
        }
        let offset = self.file_offset(index);
        let begin = (offset / self.piece_length) as usize;
        if file.length == 0 {
            return begin..begin;
        }
        let end = (offset + file.length).div_ceil(self.piece_length) as usize;
        begin..end
    }

    /// File listing with piece boundaries, in transfer order.
    pub fn entries(&self) -> Vec<FileEntry> {
        (0..self.files.len())
            .map(|index| {
                let file = &self.files[index];
                let pieces = self.piece_range(index);
                FileEntry {
                    index,
                    path: file.path.clone(),
                    name: short_name(&file.path).to_string(),
                    length: file.length,
                    offset: self.file_offset(index),
                    begin_piece: pieces.start,
                    end_piece: pieces.end,
                }
            })
            .collect()
    }
}

// =============================================================================
// File Models
// =============================================================================

/// A logical file with its position in the transfer and its piece range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Index of the file inside the transfer
    pub index: usize,
    pub path: String,
    /// Display name (last path component)
    pub name: String,
    pub length: u64,
    /// Byte offset inside the concatenated transfer
    pub offset: u64,
    pub begin_piece: usize,
    pub end_piece: usize,
}

impl FileEntry {
    pub fn pieces(&self) -> Range<usize> {
        self.begin_piece..self.end_piece
    }

    pub fn piece_count(&self) -> usize {
        self.end_piece.saturating_sub(self.begin_piece)
    }

    /// First 5% of the piece range (at least one piece), fetched first for fast startup
    pub fn startup_pieces(&self) -> Range<usize> {
        if self.piece_count() == 0 {
            return self.pieces();
        }
        let boost = (self.begin_piece + self.piece_count() / 20).max(self.begin_piece + 1);
        self.begin_piece..boost
    }

    pub fn is_media(&self) -> bool {
        is_media_file(&self.path)
    }
}

impl fmt::Display for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}  {}", self.name, human_size(self.length))
    }
}

/// Download completion of one file, derived from completed pieces in its range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileProgress {
    pub index: usize,
    pub name: String,
    pub completed_pieces: usize,
    pub total_pieces: usize,
    pub percent: f64,
}

impl FileProgress {
    pub fn new(entry: &FileEntry, completed_pieces: usize) -> Self {
        let total_pieces = entry.piece_count();
        let percent = if total_pieces == 0 {
            0.0
        } else {
            completed_pieces as f64 / total_pieces as f64 * 100.0
        };
        Self {
            index: entry.index,
            name: entry.name.clone(),
            completed_pieces,
            total_pieces,
            percent,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total_pieces > 0 && self.completed_pieces >= self.total_pieces
    }
}

impl fmt::Display for FileProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:.1}% ({}/{} pieces)",
            self.name, self.percent, self.completed_pieces, self.total_pieces
        )
    }
}

// =============================================================================
// Playback Models
// =============================================================================

/// Lifecycle of the external player process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    /// No process running
    #[default]
    Idle,
    /// Process spawned, control endpoint not there yet
    Launching,
    /// Polling the control endpoint
    Connecting,
    /// Connected and driving the playlist
    Active,
    /// Quit requested, waiting for exit or killing
    Terminating,
}

impl PlayerState {
    pub fn is_running(&self) -> bool {
        !matches!(self, PlayerState::Idle)
    }
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerState::Idle => write!(f, "Idle"),
            PlayerState::Launching => write!(f, "Launching..."),
            PlayerState::Connecting => write!(f, "Connecting..."),
            PlayerState::Active => write!(f, "Playing"),
            PlayerState::Terminating => write!(f, "Stopping..."),
        }
    }
}

/// Snapshot of the running playback session for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackStatus {
    pub state: PlayerState,
    /// Current playlist position
    pub position: usize,
    pub playlist_len: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<FileProgress>,
    pub elapsed_secs: u64,
}

impl PlaybackStatus {
    pub fn idle() -> Self {
        Self {
            state: PlayerState::Idle,
            position: 0,
            playlist_len: 0,
            title: None,
            progress: None,
            elapsed_secs: 0,
        }
    }
}

impl fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state)?;
        if self.playlist_len > 1 {
            write!(f, " [{}/{}]", self.position + 1, self.playlist_len)?;
        }
        if let Some(title) = &self.title {
            write!(f, " {}", title)?;
        }
        if let Some(progress) = &self.progress {
            write!(f, " - buffer {:.1}%", progress.percent)?;
        }
        write!(f, " ({}s)", self.elapsed_secs)
    }
}

// =============================================================================
// Helpers
// =============================================================================

const MEDIA_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "webm", "m4v", "mov", "ts", "flv", "ogv", "wmv",
];

/// Check whether a path looks like a playable video file
pub fn is_media_file(path: &str) -> bool {
    path.rsplit_once('.')
        .map(|(_, ext)| MEDIA_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Last component of a `/`-separated path
pub fn short_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Format a byte count for display
pub fn human_size(bytes: u64) -> String {
    const KB: u64 = 1 << 10;
    const GB: u64 = 1 << 30;
    match bytes {
        b if b >= GB => format!("{:.1} GB", b as f64 / GB as f64),
        b if b >= MIB => format!("{:.1} MB", b as f64 / MIB as f64),
        b if b >= KB => format!("{:.1} KB", b as f64 / KB as f64),
        b => format!("{} B", b),
    }
}
