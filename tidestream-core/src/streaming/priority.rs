//! Deadline assignment for a window of wanted pieces.
//!
//! The first piece of a request gets an extreme deadline so playback can
//! start even when the window later grows behind it. Remaining pieces get a
//! deadline that grows with their distance from the smallest requested index,
//! except pieces in the possible footer range, which are ranked by distance to
//! the end of that range because container indexes are read from the tail.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tracing::debug;

use crate::engine::TorrentEngine;
use crate::torrent::{PieceIndex, SessionState};

/// Deadline for the first piece of every request.
pub const FIRST_PIECE_DEADLINE: i32 = -10_000;
/// Base deadline for the rest of a request, already past due.
pub const BASE_DEADLINE: i32 = -5_000;
/// Deadline added per piece of distance.
pub const DEADLINE_STEP: i32 = 700;

/// Issues piece deadlines on behalf of download controllers.
pub trait PiecePriorities: Send + Sync {
    /// Requests exactly `pieces`, in order of urgency.
    ///
    /// An empty slice is a no-op.
    fn download_only(&self, pieces: &[PieceIndex], possible_footer: &RangeInclusive<u32>);

    /// Drops every deadline on the torrent, including other files' windows.
    fn clear_all(&self);

    /// Number of [`Self::clear_all`] calls so far, across all controllers.
    fn clear_count(&self) -> u64;
}

/// Computes the `(piece, deadline)` commands for a request.
pub fn assign_deadlines(
    pieces: &[PieceIndex],
    possible_footer: &RangeInclusive<u32>,
) -> Vec<(PieceIndex, i32)> {
    let Some((&first, rest)) = pieces.split_first() else {
        return Vec::new();
    };
    let smallest = pieces.iter().map(|piece| piece.as_u32()).min().unwrap_or(0);

    let mut deadlines = Vec::with_capacity(pieces.len());
    deadlines.push((first, FIRST_PIECE_DEADLINE));
    for &piece in rest {
        let index = piece.as_u32();
        let distance = if possible_footer.contains(&index) {
            possible_footer.end() - index
        } else {
            index - smallest
        };
        let deadline = BASE_DEADLINE as i64 + distance as i64 * DEADLINE_STEP as i64;
        deadlines.push((piece, deadline.min(i32::MAX as i64) as i32));
    }
    deadlines
}

/// [`PiecePriorities`] backed by an engine handle.
///
/// Stops issuing commands once the owning session is closed.
pub struct EngineDeadlines {
    engine: Arc<dyn TorrentEngine>,
    lifecycle: watch::Receiver<SessionState>,
    torrent_id: String,
    clears: AtomicU64,
}

impl EngineDeadlines {
    pub fn new(
        engine: Arc<dyn TorrentEngine>,
        lifecycle: watch::Receiver<SessionState>,
        torrent_id: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            lifecycle,
            torrent_id: torrent_id.into(),
            clears: AtomicU64::new(0),
        }
    }

    fn is_closed(&self) -> bool {
        *self.lifecycle.borrow() == SessionState::Closed
    }
}

impl PiecePriorities for EngineDeadlines {
    fn download_only(&self, pieces: &[PieceIndex], possible_footer: &RangeInclusive<u32>) {
        if pieces.is_empty() || self.is_closed() {
            return;
        }
        debug!(
            "[{}] Prioritizing pieces: {:?}",
            self.torrent_id,
            pieces.iter().map(|p| p.as_u32()).collect::<Vec<_>>()
        );
        for (piece, deadline) in assign_deadlines(pieces, possible_footer) {
            self.engine.set_piece_deadline(piece, deadline);
        }
    }

    fn clear_all(&self) {
        if self.is_closed() {
            return;
        }
        self.clears.fetch_add(1, Ordering::AcqRel);
        self.engine.clear_piece_deadlines();
    }

    fn clear_count(&self) -> u64 {
        self.clears.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineCommand, SimulatedEngine, TorrentLayout};

    fn indices(values: &[u32]) -> Vec<PieceIndex> {
        values.iter().copied().map(PieceIndex::new).collect()
    }

    #[allow(clippy::reversed_empty_ranges)]
    fn no_footer() -> RangeInclusive<u32> {
        1..=0
    }

    #[test]
    fn test_empty_request_assigns_nothing() {
        assert!(assign_deadlines(&[], &no_footer()).is_empty());
    }

    #[test]
    fn test_first_piece_is_most_urgent_and_rest_increase() {
        let deadlines = assign_deadlines(&indices(&[10, 11, 12]), &no_footer());

        assert_eq!(deadlines[0], (PieceIndex::new(10), FIRST_PIECE_DEADLINE));
        assert_eq!(deadlines[1].1, BASE_DEADLINE + DEADLINE_STEP);
        assert_eq!(deadlines[2].1, BASE_DEADLINE + 2 * DEADLINE_STEP);
        assert!(deadlines[0].1 < deadlines[1].1 && deadlines[1].1 < deadlines[2].1);
    }

    #[test]
    fn test_distance_is_from_smallest_index() {
        // First piece is a seek target after lower pieces were queued.
        let deadlines = assign_deadlines(&indices(&[5, 3, 4]), &no_footer());

        assert_eq!(deadlines[0].1, FIRST_PIECE_DEADLINE);
        assert_eq!(deadlines[1].1, BASE_DEADLINE);
        assert_eq!(deadlines[2].1, BASE_DEADLINE + DEADLINE_STEP);
    }

    #[test]
    fn test_footer_pieces_ranked_by_distance_to_tail() {
        let deadlines = assign_deadlines(&indices(&[0, 1, 97, 98, 99]), &(96..=99));

        assert_eq!(deadlines[1].1, BASE_DEADLINE + DEADLINE_STEP);
        assert_eq!(deadlines[2].1, BASE_DEADLINE + 2 * DEADLINE_STEP);
        assert_eq!(deadlines[3].1, BASE_DEADLINE + DEADLINE_STEP);
        assert_eq!(deadlines[4].1, BASE_DEADLINE);
        // The tail piece beats the middle of the footer.
        assert!(deadlines[4].1 < deadlines[2].1);
    }

    #[test]
    fn test_engine_deadlines_issue_one_command_per_piece() {
        let engine = Arc::new(SimulatedEngine::new(TorrentLayout::from_files(16, vec![])));
        let (_state_tx, state_rx) = watch::channel(SessionState::Ready);
        let priorities = EngineDeadlines::new(engine.clone(), state_rx, "test");

        priorities.download_only(&indices(&[2, 3]), &no_footer());
        priorities.download_only(&[], &no_footer());

        assert_eq!(
            engine.take_commands(),
            vec![
                EngineCommand::SetPieceDeadline(PieceIndex::new(2), FIRST_PIECE_DEADLINE),
                EngineCommand::SetPieceDeadline(PieceIndex::new(3), BASE_DEADLINE + DEADLINE_STEP),
            ]
        );
    }

    #[test]
    fn test_engine_deadlines_silent_after_close() {
        let engine = Arc::new(SimulatedEngine::new(TorrentLayout::from_files(16, vec![])));
        let (state_tx, state_rx) = watch::channel(SessionState::Ready);
        let priorities = EngineDeadlines::new(engine.clone(), state_rx, "test");

        state_tx.send_replace(SessionState::Closed);
        priorities.download_only(&indices(&[1]), &no_footer());
        priorities.clear_all();

        assert!(engine.take_commands().is_empty());
        assert_eq!(priorities.clear_count(), 0);
    }

    #[test]
    fn test_engine_deadlines_count_clears() {
        let engine = Arc::new(SimulatedEngine::new(TorrentLayout::from_files(16, vec![])));
        let (_state_tx, state_rx) = watch::channel(SessionState::Ready);
        let priorities = EngineDeadlines::new(engine.clone(), state_rx, "test");

        priorities.clear_all();
        priorities.clear_all();

        assert_eq!(priorities.clear_count(), 2);
        assert_eq!(
            engine.take_commands(),
            vec![EngineCommand::ClearPieceDeadlines, EngineCommand::ClearPieceDeadlines]
        );
    }
}
