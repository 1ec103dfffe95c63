//! Torrent-side state: pieces, file layout, and the download session.

pub mod deferred;
pub mod file;
pub mod file_mapper;
pub mod piece;
pub mod session;
pub mod stats;

use std::fmt;

pub use deferred::DeferredQueue;
pub use file_mapper::map_file_pieces;
pub use piece::{Piece, PieceState, PieceTable};
pub use file::{TorrentFileEntry, TorrentFileHandle};
pub use session::{SessionHook, SessionState, TorrentDescriptor, TorrentSession};
pub use stats::{DownloadStats, StatsSnapshot};

/// Zero-based index of a piece within a torrent.
///
/// Torrent files are divided into pieces for downloading and verification.
/// Each piece has a sequential index starting from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during torrent session operations.
///
/// Geometry, reload, and queue errors are invariant violations and are never
/// retried. `SessionClosed` is final: retrying cannot help.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Invalid piece geometry: {reason}")]
    InvalidGeometry { reason: String },

    #[error("Piece {index} out of range")]
    PieceOutOfRange { index: PieceIndex },

    #[error("File {index} out of range")]
    FileOutOfRange { index: usize },

    #[error("Failed to reload file metadata: {reason}")]
    ReloadFailed { reason: String },

    #[error("Torrent metadata already initialized")]
    AlreadyInitialized,

    #[error("Deferred callback queue already disposed")]
    QueueAlreadyDisposed,

    #[error("Session is closed")]
    SessionClosed,

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}
