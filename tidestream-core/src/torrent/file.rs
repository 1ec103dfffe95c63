//! Files of a torrent and the handles that keep them open.

use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use super::piece::{Piece, PieceTable};
use super::session::{SessionState, TorrentSession};
use super::{PieceIndex, TorrentError};
use crate::engine::{FilePriority, TorrentEngine};
use crate::streaming::{DownloadController, StreamingError, TorrentReader};

/// One file of a torrent, with its piece span and download controller.
pub struct TorrentFileEntry {
    pub(super) index: usize,
    pub(super) offset: u64,
    pub(super) length: u64,
    pub(super) relative_path: String,
    pub(super) save_directory: PathBuf,
    pub(super) span: Range<u32>,
    pub(super) table: Arc<PieceTable>,
    pub(super) downloaded_bytes: AtomicU64,
    pub(super) controller: Mutex<DownloadController>,
    pub(super) engine: Arc<dyn TorrentEngine>,
    pub(super) lifecycle: watch::Receiver<SessionState>,
    pub(super) session: Weak<TorrentSession>,
    pub(super) torrent_id: String,
}

impl TorrentFileEntry {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Offset of the first byte of this file within the torrent.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    /// Location of this file on disk.
    pub fn file_path(&self) -> PathBuf {
        self.save_directory.join(&self.relative_path)
    }

    pub fn piece_span(&self) -> Range<u32> {
        self.span.clone()
    }

    pub fn pieces(&self) -> &[Piece] {
        self.table.span(&self.span)
    }

    pub fn table(&self) -> &Arc<PieceTable> {
        &self.table
    }

    pub fn contains_piece(&self, piece: PieceIndex) -> bool {
        self.span.contains(&piece.as_u32())
    }

    /// Piece holding the byte at `position` bytes into this file.
    pub fn piece_at(&self, position: u64) -> Option<&Piece> {
        if position >= self.length {
            return None;
        }
        let absolute = self.offset + position;
        let pieces = self.pieces();
        pieces.get(pieces.partition_point(|piece| piece.end() <= absolute))
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::Acquire)
    }

    /// Fraction downloaded from 0.0 to 1.0; zero for empty files.
    pub fn progress(&self) -> f32 {
        if self.length == 0 {
            return 0.0;
        }
        self.downloaded_bytes() as f32 / self.length as f32
    }

    pub fn is_finished(&self) -> bool {
        self.downloaded_bytes() >= self.length
    }

    /// Window currently requested for this file.
    pub fn current_window(&self) -> Vec<PieceIndex> {
        self.controller.lock().window().to_vec()
    }

    /// Opens a new handle that keeps the session alive.
    ///
    /// # Errors
    ///
    /// - `TorrentError::SessionClosed` - If the session has been closed
    pub fn create_handle(self: &Arc<Self>) -> Result<TorrentFileHandle, TorrentError> {
        let session = self.session.upgrade().ok_or(TorrentError::SessionClosed)?;
        session.register_handle(self.clone())
    }

    /// Forwards a file priority to the engine.
    pub fn set_priority(&self, priority: FilePriority) {
        if self.is_session_closed() {
            return;
        }
        info!(
            "[{}] Set file priority to {}: {}",
            self.torrent_id, priority, self.relative_path
        );
        self.engine.set_file_priority(self.index, priority);
    }

    /// Makes sure `piece` is being fetched, moving the window if needed.
    ///
    /// Called by readers that hit missing data.
    pub fn request_piece(&self, piece: PieceIndex) {
        if self.is_session_closed() {
            return;
        }
        let mut controller = self.controller.lock();
        if controller.is_downloading(piece) {
            debug!(
                "[{}] Requested piece {} is already downloading",
                self.torrent_id, piece
            );
            return;
        }
        info!(
            "[{}] Resetting deadlines to download {}",
            self.torrent_id, piece
        );
        controller.on_seek(piece);
    }

    pub(crate) fn lifecycle(&self) -> watch::Receiver<SessionState> {
        self.lifecycle.clone()
    }

    fn is_session_closed(&self) -> bool {
        *self.lifecycle.borrow() == SessionState::Closed
    }

    /// Raises downloaded bytes to the finished bytes in this file's span.
    ///
    /// Lazy compare-and-set: skipped when already complete, and lost races
    /// leave the value another path stored.
    pub(super) fn refresh_downloaded_bytes(&self) {
        let current = self.downloaded_bytes.load(Ordering::Acquire);
        if current >= self.length {
            return;
        }
        let computed = self.table.finished_bytes(&self.span).min(self.length);
        if computed > current {
            let _ = self.downloaded_bytes.compare_exchange(
                current,
                computed,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }
}

impl fmt::Debug for TorrentFileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TorrentFileEntry")
            .field("index", &self.index)
            .field("relative_path", &self.relative_path)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("span", &self.span)
            .finish()
    }
}

/// Open use of a file. The session stays open while any handle is open.
///
/// Dropping a handle closes it.
pub struct TorrentFileHandle {
    pub(super) id: u64,
    pub(super) session: Arc<TorrentSession>,
    pub(super) entry: Arc<TorrentFileEntry>,
    pub(super) closed: AtomicBool,
}

impl TorrentFileHandle {
    pub fn entry(&self) -> &Arc<TorrentFileEntry> {
        &self.entry
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sets the file priority, re-asserts the window, then resumes the engine.
    ///
    /// # Errors
    ///
    /// - `TorrentError::SessionClosed` - If this handle or its session is closed
    pub fn resume(&self, priority: FilePriority) -> Result<(), TorrentError> {
        self.ensure_open()?;
        self.entry.set_priority(priority);
        self.entry.controller.lock().on_torrent_resumed();
        self.session.engine().resume();
        Ok(())
    }

    /// # Errors
    ///
    /// - `TorrentError::SessionClosed` - If this handle or its session is closed
    pub fn pause(&self) -> Result<(), TorrentError> {
        self.ensure_open()?;
        self.session.engine().pause();
        Ok(())
    }

    /// Opens a seekable reader over this file.
    ///
    /// # Errors
    ///
    /// - `StreamingError::SessionClosed` - If this handle or its session is closed
    pub fn open_reader(&self) -> Result<TorrentReader, StreamingError> {
        if self.ensure_open().is_err() {
            return Err(StreamingError::SessionClosed);
        }
        TorrentReader::new(self.entry.clone(), &self.session.config().reader)
    }

    /// Releases this handle; closes the session if it was the last one.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.session.release_handle(self.id);
    }

    /// Closes this handle and deletes the torrent's data if nothing else uses it.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - If the data directory cannot be removed
    pub async fn close_and_delete(&self) -> Result<bool, TorrentError> {
        self.close();
        self.session.delete_entire_torrent_if_not_in_use().await
    }

    fn ensure_open(&self) -> Result<(), TorrentError> {
        if self.is_closed() || self.session.is_closed() {
            return Err(TorrentError::SessionClosed);
        }
        Ok(())
    }
}

impl Drop for TorrentFileHandle {
    fn drop(&mut self) {
        self.close();
    }
}

