//! Per-file download window.
//!
//! The controller keeps a bounded window of wanted pieces ahead of the read
//! position. Completions slide the window forward; reads of missing data move
//! it to the requested piece. Header and footer pieces are requested early
//! because most containers need them before the first frame can be decoded.

use std::ops::{Range, RangeInclusive};
use std::sync::Arc;

use tracing::{debug, warn};

use super::priority::PiecePriorities;
use crate::config::SchedulerConfig;
use crate::torrent::{PieceIndex, PieceState, PieceTable};

/// Stateful scheduler for one file of a torrent.
///
/// Not internally synchronized; the owning file entry serializes access.
pub struct DownloadController {
    table: Arc<PieceTable>,
    span: Range<u32>,
    priorities: Arc<dyn PiecePriorities>,
    window_size: usize,
    /// Pieces below this index hold the file header
    header_end: u32,
    footer_pieces: Vec<PieceIndex>,
    possible_footer: RangeInclusive<u32>,
    window: Vec<PieceIndex>,
    /// Footer pieces requested alongside the window
    extras: Vec<PieceIndex>,
    pending_seek: Option<PieceIndex>,
    /// Clear count right after the pending seek was issued
    seek_clears: u64,
    started: bool,
}

impl DownloadController {
    /// Creates a controller for the pieces in `span`.
    ///
    /// Nothing is requested until [`Self::on_torrent_resumed`] or
    /// [`Self::on_seek`] is called.
    pub fn new(
        table: Arc<PieceTable>,
        span: Range<u32>,
        priorities: Arc<dyn PiecePriorities>,
        config: &SchedulerConfig,
    ) -> Self {
        let pieces = table.span(&span);
        let piece_size = pieces.first().map_or(1024, |piece| piece.size());
        let window_size = config.window_size(piece_size);

        let header_count = count_covering(pieces.iter().map(|p| p.size()), config.header_size);
        let footer_count = count_covering(pieces.iter().rev().map(|p| p.size()), config.footer_size);
        let possible_footer_count = count_covering(
            pieces.iter().rev().map(|p| p.size()),
            config.possible_footer_size,
        );

        let footer_pieces = pieces[pieces.len() - footer_count..]
            .iter()
            .map(|p| p.index())
            .collect();
        #[allow(clippy::reversed_empty_ranges)]
        let possible_footer = if possible_footer_count == 0 {
            1..=0
        } else {
            (span.end - possible_footer_count as u32)..=(span.end - 1)
        };

        Self {
            header_end: span.start + header_count as u32,
            table,
            span,
            priorities,
            window_size,
            footer_pieces,
            possible_footer,
            window: Vec::new(),
            extras: Vec::new(),
            pending_seek: None,
            seek_clears: 0,
            started: false,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Pieces currently prioritized, in request order.
    pub fn window(&self) -> &[PieceIndex] {
        &self.window
    }

    /// Tail range ranked by distance to the end of the file.
    pub fn possible_footer_range(&self) -> &RangeInclusive<u32> {
        &self.possible_footer
    }

    pub fn contains(&self, piece: PieceIndex) -> bool {
        self.span.contains(&piece.as_u32())
    }

    /// True when the piece is being fetched or is the target of the latest
    /// seek that has not completed yet.
    ///
    /// A pending seek stops counting once any controller clears the
    /// torrent's deadlines again, since its request was dropped with them.
    pub fn is_downloading(&self, piece: PieceIndex) -> bool {
        let seek_in_flight = self.pending_seek == Some(piece)
            && self.priorities.clear_count() == self.seek_clears;
        seek_in_flight || self.table.state(piece) == Some(PieceState::Downloading)
    }

    /// (Re)asserts the window after the torrent is resumed.
    ///
    /// The first call requests the head of the file plus its footer; later
    /// calls re-issue whatever is still unfinished, because the engine may
    /// have dropped deadlines while paused.
    pub fn on_torrent_resumed(&mut self) {
        if !self.started {
            self.started = true;
            self.window = self.collect_unfinished(self.span.start, self.window_size);
            self.extras = self.unrequested_footer();
        } else {
            self.retain_unfinished();
            let start = self.next_window_start(self.span.start);
            let missing = self.window_size - self.window.len();
            let added = self.collect_unfinished(start, missing);
            self.window.extend(added);
        }
        debug!(
            "Resumed window {:?} with {} footer pieces",
            self.window_bounds(),
            self.extras.len()
        );
        self.submit_all();
    }

    /// Handles completion of a piece. Returns true if the window moved.
    pub fn on_piece_downloaded(&mut self, piece: PieceIndex) -> bool {
        if !self.contains(piece) {
            return false;
        }
        if self.pending_seek == Some(piece) {
            self.pending_seek = None;
        }
        self.extras.retain(|p| *p != piece);

        let Some(position) = self.window.iter().position(|p| *p == piece) else {
            return false;
        };
        self.window.remove(position);
        self.retain_unfinished();

        let start = self.next_window_start(piece.as_u32() + 1);
        let missing = self.window_size - self.window.len();
        let added = self.collect_unfinished(start, missing);
        if !added.is_empty() {
            debug!(
                "Piece {} done, window slides by {:?}",
                piece,
                added.iter().map(|p| p.as_u32()).collect::<Vec<_>>()
            );
            self.priorities.download_only(&added, &self.possible_footer);
            self.window.extend(added);
        }
        true
    }

    /// Moves the window so it starts at `target`.
    ///
    /// A target that is already being fetched is left alone. Otherwise every
    /// deadline on the torrent is cleared and the new window requested; a
    /// seek past the header also asks for the footer again.
    pub fn on_seek(&mut self, target: PieceIndex) {
        if !self.contains(target) {
            warn!("Seek to piece {} outside of file span {:?}", target, self.span);
            return;
        }
        if self.is_downloading(target) {
            debug!("Seek target {} already downloading", target);
            return;
        }

        self.started = true;
        self.priorities.clear_all();
        self.window.clear();
        self.window = self.collect_unfinished(target.as_u32(), self.window_size);
        self.extras = if target.as_u32() >= self.header_end {
            self.unrequested_footer()
        } else {
            Vec::new()
        };
        self.pending_seek = Some(target);
        self.seek_clears = self.priorities.clear_count();

        debug!(
            "Seek to {} resets window to {:?}",
            target,
            self.window_bounds()
        );
        self.submit_all();
    }

    fn submit_all(&self) {
        let mut request = self.window.clone();
        request.extend_from_slice(&self.extras);
        self.priorities.download_only(&request, &self.possible_footer);
    }

    fn retain_unfinished(&mut self) {
        let table = &self.table;
        self.window.retain(|p| !table.is_finished(*p));
        self.extras.retain(|p| !table.is_finished(*p));
    }

    /// Index after the last window entry, or `fallback` for an empty window.
    fn next_window_start(&self, fallback: u32) -> u32 {
        self.window
            .last()
            .map_or(fallback, |last| last.as_u32() + 1)
    }

    /// Up to `limit` unfinished pieces of this file from `start` onward that
    /// are not in the window already.
    fn collect_unfinished(&self, start: u32, limit: usize) -> Vec<PieceIndex> {
        let start = start.max(self.span.start);
        self.table
            .span(&(start..self.span.end))
            .iter()
            .filter(|piece| piece.state() != PieceState::Finished)
            .map(|piece| piece.index())
            .filter(|index| !self.window.contains(index))
            .take(limit)
            .collect()
    }

    fn unrequested_footer(&self) -> Vec<PieceIndex> {
        self.footer_pieces
            .iter()
            .copied()
            .filter(|p| !self.table.is_finished(*p) && !self.window.contains(p))
            .collect()
    }

    fn window_bounds(&self) -> Option<(u32, u32)> {
        Some((self.window.first()?.as_u32(), self.window.last()?.as_u32()))
    }
}

/// Number of leading sizes needed to cover `budget` bytes.
fn count_covering(sizes: impl Iterator<Item = u64>, budget: u64) -> usize {
    let mut covered = 0u64;
    let mut count = 0;
    for size in sizes {
        if covered >= budget {
            break;
        }
        covered += size;
        count += 1;
    }
    count
}
