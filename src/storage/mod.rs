//! In-memory piece storage
//!
//! Payload data never touches the disk: every transfer gets a [`MemTransfer`]
//! holding its pieces in RAM until playback has moved past them.

pub mod memory;

pub use memory::{CacheError, MemTransfer, MemoryStorage, PieceEntry, PieceRead};
