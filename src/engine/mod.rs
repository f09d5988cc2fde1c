//! Transfer engine interface
//!
//! The swarm engine that finds peers, fetches and verifies pieces lives outside
//! this crate. It stores what it fetches through the per-piece handles of
//! [`crate::storage::MemTransfer`] (`read_at`, `write_at`, `mark_complete`) and
//! takes fetch-order hints through [`TransferEngine`].

pub mod local;

use std::ops::Range;

use thiserror::Error;
use tokio::sync::watch;

use crate::models::{Priority, TransferLayout};

pub use local::LocalEngine;

/// Errors from the transfer engine boundary
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transfer engine stopped before metadata arrived")]
    Closed,
    #[error("failed to read source: {0}")]
    Source(#[from] std::io::Error),
    #[error("no source files given")]
    NoFiles,
}

/// What the streaming pipeline needs from a transfer engine
pub trait TransferEngine: Send + Sync + 'static {
    /// Readiness signal; holds `Some(layout)` once metadata is known.
    fn metadata(&self) -> watch::Receiver<Option<TransferLayout>>;

    /// Priority of a single piece
    fn set_piece_priority(&self, piece: usize, priority: Priority);

    /// Priority of every piece of a logical file
    fn set_file_priority(&self, file: usize, priority: Priority);

    fn set_piece_range_priority(&self, pieces: Range<usize>, priority: Priority) {
        for piece in pieces {
            self.set_piece_priority(piece, priority);
        }
    }
}

/// Wait for the engine's readiness signal and return the transfer layout.
pub async fn got_metadata(engine: &dyn TransferEngine) -> Result<TransferLayout, EngineError> {
    let mut rx = engine.metadata();
    let ready = rx
        .wait_for(Option::is_some)
        .await
        .map_err(|_| EngineError::Closed)?;
    ready.clone().ok_or(EngineError::Closed)
}
