//! Streaming bridge
//!
//! - Reader: piece-backed, blocking-until-available file reads with read-ahead
//! - Server: loopback HTTP server exposing the published files with range support

pub mod reader;
pub mod server;

pub use reader::{readahead_window, FileReader};
pub use server::{ServerError, StreamServer, VirtualFileSet};
