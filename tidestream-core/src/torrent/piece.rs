//! Piece table shared by every file of a torrent.
//!
//! Pieces live in a single arena indexed by [`PieceIndex`]. File entries refer
//! to contiguous index spans of the arena, so a piece sitting on a file
//! boundary is visible to both files without either of them owning it.

use std::ops::Range;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Notify;

use super::{PieceIndex, TorrentError};

/// Download state of a single piece.
///
/// States only move forward: `Ready` -> `Downloading` -> `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PieceState {
    /// Not requested from peers yet
    Ready = 0,
    /// At least one block is in flight
    Downloading = 1,
    /// Verified and written to disk
    Finished = 2,
}

impl PieceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PieceState::Ready,
            1 => PieceState::Downloading,
            _ => PieceState::Finished,
        }
    }
}

/// Immutable byte range of the torrent plus its mutable download state.
#[derive(Debug)]
pub struct Piece {
    index: PieceIndex,
    offset: u64,
    size: u64,
    state: AtomicU8,
}

impl Piece {
    /// Creates a piece in the `Ready` state.
    pub fn new(index: PieceIndex, offset: u64, size: u64) -> Self {
        Self {
            index,
            offset,
            size,
            state: AtomicU8::new(PieceState::Ready as u8),
        }
    }

    pub fn index(&self) -> PieceIndex {
        self.index
    }

    /// Offset of the first byte of this piece within the torrent.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Offset one past the last byte of this piece.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn state(&self) -> PieceState {
        PieceState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves `Ready` to `Downloading`. Returns false for any other state.
    fn begin_download(&self) -> bool {
        self.state
            .compare_exchange(
                PieceState::Ready as u8,
                PieceState::Downloading as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Moves any state to `Finished`. Returns true only for the call that
    /// performed the transition.
    fn finish(&self) -> bool {
        let previous = self
            .state
            .fetch_max(PieceState::Finished as u8, Ordering::AcqRel);
        previous != PieceState::Finished as u8
    }
}

/// Authoritative piece arena for one torrent.
///
/// Every state change that finishes a piece wakes the tasks waiting in
/// [`PieceTable::notified`], which is how readers block on missing data.
#[derive(Debug)]
pub struct PieceTable {
    pieces: Vec<Piece>,
    piece_length: u32,
    finished_notify: Notify,
}

impl PieceTable {
    /// Builds `piece_count` pieces of `piece_length` bytes, except the last
    /// which is `last_piece_size` bytes long.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidGeometry` - If a piece would be empty or the
    ///   last piece is longer than the nominal piece length
    pub fn build(
        piece_count: u32,
        piece_length: u32,
        last_piece_size: u32,
    ) -> Result<Self, TorrentError> {
        if piece_count > 0
            && (piece_length == 0 || last_piece_size == 0 || last_piece_size > piece_length)
        {
            return Err(TorrentError::InvalidGeometry {
                reason: format!(
                    "piece_length={piece_length}, last_piece_size={last_piece_size}, piece_count={piece_count}"
                ),
            });
        }

        let mut offset = 0u64;
        let pieces = (0..piece_count)
            .map(|index| {
                let size = if index + 1 == piece_count {
                    last_piece_size
                } else {
                    piece_length
                } as u64;
                let piece = Piece::new(PieceIndex::new(index), offset, size);
                offset += size;
                piece
            })
            .collect();

        Ok(Self {
            pieces,
            piece_length,
            finished_notify: Notify::new(),
        })
    }

    /// Nominal piece length in bytes.
    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Total number of bytes covered by the table.
    pub fn total_size(&self) -> u64 {
        self.pieces.last().map_or(0, Piece::end)
    }

    pub fn get(&self, index: PieceIndex) -> Option<&Piece> {
        self.pieces.get(index.as_usize())
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    /// Pieces within an index span, clamped to the table.
    pub fn span(&self, span: &Range<u32>) -> &[Piece] {
        let end = (span.end as usize).min(self.pieces.len());
        let start = (span.start as usize).min(end);
        &self.pieces[start..end]
    }

    /// Returns the state of a piece, or `None` for an unknown index.
    pub fn state(&self, index: PieceIndex) -> Option<PieceState> {
        self.get(index).map(Piece::state)
    }

    pub fn is_finished(&self, index: PieceIndex) -> bool {
        self.state(index) == Some(PieceState::Finished)
    }

    /// Records that the engine started fetching a piece.
    ///
    /// Unknown indices and pieces that already left `Ready` are ignored.
    pub fn mark_downloading(&self, index: PieceIndex) -> bool {
        self.get(index).is_some_and(Piece::begin_download)
    }

    /// Records that a piece is complete and wakes waiting readers.
    ///
    /// Returns true only when this call performed the transition.
    pub fn mark_finished(&self, index: PieceIndex) -> bool {
        let changed = self.get(index).is_some_and(Piece::finish);
        if changed {
            self.finished_notify.notify_waiters();
        }
        changed
    }

    /// Sum of finished piece sizes within a span.
    pub fn finished_bytes(&self, span: &Range<u32>) -> u64 {
        self.span(span)
            .iter()
            .filter(|piece| piece.state() == PieceState::Finished)
            .map(Piece::size)
            .sum()
    }

    /// Future resolved on the next piece completion.
    ///
    /// Create it before checking state, then await it, so a completion between
    /// the check and the await is not missed.
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.finished_notify.notified()
    }

    /// Wakes all waiters without changing state. Used on session close.
    pub(crate) fn wake_all(&self) {
        self.finished_notify.notify_waiters();
    }
}
