//! Integration tests for memstream
//!
//! Tests are organized by component:
//! - storage_test: In-memory piece cache
//! - server_test: HTTP bridge (ranges, routing, waiting on pieces)
//! - coordinator_test: Playlist-driven priorities and eviction
//! - player_test: mpv session lifecycle against a stand-in player (Unix)
//! - cli_test: Command handlers and exit codes
//! - e2e_test: Local files -> engine -> bridge -> client, full playback session

// Note: Each test file is a separate integration test crate
// Tests are run individually by cargo, not via mod.rs
