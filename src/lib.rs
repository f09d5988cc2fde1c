//! memstream - stream pieced transfers to mpv straight from memory
//!
//! Pieces fetched by a transfer engine live only in RAM. A loopback HTTP
//! bridge exposes the transfer's files as seekable streams, and a
//! coordinator follows mpv through its playlist, fetching ahead of the
//! playing file and releasing the ones already watched.
//!
//! # Modules
//!
//! - `models` - Transfer layout, file entries, priorities, playback status
//! - `storage` - In-memory piece cache
//! - `engine` - Transfer engine interface and the local-file engine
//! - `stream` - Piece-aware file readers and the HTTP bridge
//! - `player` - mpv process and JSON IPC control
//! - `coordinator` - Priorities and eviction driven by playlist position
//! - `app` - One transfer, its bridge and its playback session
//! - `cli`, `commands`, `config` - Command line front end

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod models;
pub mod player;
pub mod storage;
pub mod stream;

// Re-export commonly used types
pub use models::{
    FileEntry, FileInfo, FileProgress, PlaybackStatus, PlayerState, Priority, TransferId,
    TransferLayout,
};

pub use app::{PlaybackError, StreamApp};
pub use config::Config;
pub use coordinator::{PlaybackCoordinator, Transition};
pub use engine::{got_metadata, EngineError, LocalEngine, TransferEngine};
pub use player::{MpvPlayer, PlayerError, PlayerEvent, SessionEnd};
pub use storage::{CacheError, MemTransfer, MemoryStorage};
pub use stream::{FileReader, StreamServer, VirtualFileSet};
