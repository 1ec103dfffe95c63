//! Maps a file's byte range within a torrent to the pieces covering it.

use std::ops::Range;

use super::TorrentError;
use super::piece::{Piece, PieceTable};

/// Returns the minimal span of piece indices whose bytes intersect
/// `[offset, offset + length)`.
///
/// A piece straddling the boundary between two files is part of both spans.
/// An empty file yields an empty span positioned at its offset.
///
/// # Errors
///
/// - `TorrentError::InvalidGeometry` - If the range ends past the torrent or
///   overflows
pub fn map_file_pieces(
    table: &PieceTable,
    offset: u64,
    length: u64,
) -> Result<Range<u32>, TorrentError> {
    let total_size = table.total_size();
    let end = offset
        .checked_add(length)
        .filter(|end| *end <= total_size)
        .ok_or_else(|| TorrentError::InvalidGeometry {
            reason: format!(
                "file range {offset}+{length} exceeds torrent size {total_size}"
            ),
        })?;

    let pieces = table.pieces();
    let first = pieces.partition_point(|piece: &Piece| piece.end() <= offset);
    if length == 0 {
        return Ok(first as u32..first as u32);
    }
    let last = pieces.partition_point(|piece: &Piece| piece.offset() < end);

    Ok(first as u32..last as u32)
}
