//! Boundary with the native BitTorrent engine.
//!
//! The engine is opaque: it accepts piece deadlines and file priorities
//! through [`TorrentEngine`] and reports progress as [`EngineEvent`]s, which
//! the event pump in [`actor`] applies to a session.

pub mod actor;
#[cfg(any(test, feature = "simulation"))]
pub mod simulated;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use actor::{EngineEventSender, spawn_event_pump};
#[cfg(any(test, feature = "simulation"))]
pub use simulated::{EngineCommand, SimulatedEngine};

use crate::torrent::PieceIndex;

/// Outbound command surface of a native torrent handle.
///
/// Commands are fire-and-forget; implementations must not block on network
/// activity. Deadlines are relative urgencies where lower is more urgent and
/// negative means "as soon as possible".
pub trait TorrentEngine: Send + Sync {
    /// Asks the engine to have a piece within `deadline` milliseconds.
    fn set_piece_deadline(&self, piece: PieceIndex, deadline: i32);

    /// Drops every deadline previously set on this torrent.
    fn clear_piece_deadlines(&self);

    fn set_file_priority(&self, file_index: usize, priority: FilePriority);

    fn resume(&self);

    fn pause(&self);

    /// Requests a fresh [`EngineEvent::StatsUpdate`].
    fn post_status_updates(&self);

    /// Reloads file metadata after local data has been checked.
    ///
    /// # Errors
    ///
    /// Returns the engine's reason when metadata cannot be reloaded.
    fn reload_file(&self) -> Result<TorrentLayout, String>;

    /// Requests an [`EngineEvent::SaveResumeData`] with the current state.
    fn post_save_resume(&self);

    /// Whether the native handle still refers to a live torrent.
    fn is_valid(&self) -> bool {
        true
    }
}

/// File download priority, ordered from "skip" to "most wanted".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FilePriority {
    Ignore,
    Low,
    Normal,
    High,
}

impl FilePriority {
    /// Numeric priority understood by libtorrent-style engines.
    pub fn as_engine_value(self) -> u8 {
        match self {
            FilePriority::Ignore => 0,
            FilePriority::Low => 1,
            FilePriority::Normal => 4,
            FilePriority::High => 7,
        }
    }
}

impl fmt::Display for FilePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilePriority::Ignore => write!(f, "ignore"),
            FilePriority::Low => write!(f, "low"),
            FilePriority::Normal => write!(f, "normal"),
            FilePriority::High => write!(f, "high"),
        }
    }
}

/// Piece and file layout reported by the engine once metadata is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentLayout {
    pub piece_count: u32,
    pub piece_length: u32,
    pub last_piece_size: u32,
    pub files: Vec<FileLayout>,
}

impl TorrentLayout {
    /// Lays out `files` back to back over pieces of `piece_length` bytes.
    pub fn from_files(piece_length: u32, files: Vec<FileLayout>) -> Self {
        let total: u64 = files.iter().map(|file| file.size).sum();
        let piece_count = total.div_ceil(piece_length as u64) as u32;
        let remainder = (total % piece_length as u64) as u32;
        let last_piece_size = match (piece_count, remainder) {
            (0, _) => 0,
            (_, 0) => piece_length,
            (_, rest) => rest,
        };

        Self {
            piece_count,
            piece_length,
            last_piece_size,
            files,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|file| file.size).sum()
    }
}

/// One file as listed in torrent metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLayout {
    /// Path inside the torrent; may be blank for single-file torrents
    pub path: String,
    pub name: String,
    pub size: u64,
}

impl FileLayout {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        let path = path.into();
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        Self { path, name, size }
    }

    /// In-torrent path, falling back to the bare name when the path is blank.
    pub fn relative_path(&self) -> &str {
        if self.path.trim().is_empty() {
            &self.name
        } else {
            &self.path
        }
    }
}

/// Transfer statistics pushed by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NativeStats {
    pub download_payload_rate: u64,
    pub upload_payload_rate: u64,
    /// Overall progress from 0.0 to 1.0
    pub progress: f32,
    pub total_payload_upload: u64,
}

/// Callbacks delivered by the engine, possibly from its own threads.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    TorrentChecked,
    PieceDownloading(PieceIndex),
    PieceFinished(PieceIndex),
    FileCompleted(usize),
    TorrentFinished,
    StatsUpdate(NativeStats),
    SaveResumeData(Vec<u8>),
}
