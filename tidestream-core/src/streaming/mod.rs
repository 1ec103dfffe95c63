//! Streaming side of a session: piece windows, deadlines, and readers.
//!
//! A [`DownloadController`] keeps the engine fetching the pieces right ahead
//! of playback, [`priority`] turns its windows into engine deadlines, and a
//! [`TorrentReader`] serves bytes while blocking on pieces still in flight.

pub mod controller;
pub mod priority;
pub mod reader;

pub use controller::DownloadController;
pub use priority::{EngineDeadlines, PiecePriorities, assign_deadlines};
pub use reader::TorrentReader;

use crate::torrent::TorrentError;

/// Errors that can occur while reading a file during download.
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    /// Session closed while the read was pending; reads cannot recover.
    #[error("Session is closed")]
    SessionClosed,

    /// Seek resolved to a negative position or past the end of the file.
    #[error("Invalid seek to {position} in file of {length} bytes")]
    InvalidSeek { position: i128, length: u64 },

    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamingError {
    /// Whether retrying the same read can never succeed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamingError::SessionClosed | StreamingError::Torrent(TorrentError::SessionClosed)
        )
    }
}
