//! Seekable reader over a file that is still downloading.
//!
//! Reads of missing data ask the file's controller for the piece and then
//! wait for its completion. Waiting is event driven: piece completion and
//! session close both wake the reader, with a slow fallback tick only as a
//! guard against a lost request.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tracing::debug;

use super::StreamingError;
use crate::config::ReaderConfig;
use crate::torrent::{PieceIndex, SessionState, TorrentFileEntry};

/// Reader over one file of a torrent.
///
/// Every read returns bytes from at most one piece.
pub struct TorrentReader {
    entry: Arc<TorrentFileEntry>,
    lifecycle: watch::Receiver<SessionState>,
    fallback_tick: Duration,
    /// Opened on first read, once data is known to exist on disk
    file: Option<File>,
    position: u64,
}

impl TorrentReader {
    /// # Errors
    ///
    /// - `StreamingError::SessionClosed` - If the session is already closed
    pub fn new(entry: Arc<TorrentFileEntry>, config: &ReaderConfig) -> Result<Self, StreamingError> {
        let lifecycle = entry.lifecycle();
        if *lifecycle.borrow() == SessionState::Closed {
            return Err(StreamingError::SessionClosed);
        }
        Ok(Self {
            entry,
            lifecycle,
            fallback_tick: config.fallback_tick,
            file: None,
            position: 0,
        })
    }

    pub fn entry(&self) -> &Arc<TorrentFileEntry> {
        &self.entry
    }

    pub fn len(&self) -> u64 {
        self.entry.length()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Moves the read position. Nothing is requested until the next read.
    ///
    /// # Errors
    ///
    /// - `StreamingError::InvalidSeek` - If the target is negative or past the end
    pub fn seek(&mut self, target: SeekFrom) -> Result<u64, StreamingError> {
        let length = self.len();
        let position = match target {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(delta) => length as i128 + delta as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
        };
        if position < 0 || position > length as i128 {
            return Err(StreamingError::InvalidSeek { position, length });
        }
        self.position = position as u64;
        Ok(self.position)
    }

    /// Reads into `buf`, waiting for the piece under the read position.
    ///
    /// Returns 0 at end of file.
    ///
    /// # Errors
    ///
    /// - `StreamingError::SessionClosed` - If the session is closed, even when
    ///   the data is already on disk
    /// - `StreamingError::Io` - If the file cannot be read
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamingError> {
        if *self.lifecycle.borrow() == SessionState::Closed {
            self.file = None;
            return Err(StreamingError::SessionClosed);
        }
        if buf.is_empty() || self.position >= self.len() {
            return Ok(0);
        }
        let (piece, piece_end) = match self.entry.piece_at(self.position) {
            Some(piece) => (piece.index(), piece.end()),
            None => return Ok(0),
        };
        self.wait_for_piece(piece).await?;

        let available_end = (piece_end - self.entry.offset()).min(self.len());
        let wanted = (available_end - self.position).min(buf.len() as u64) as usize;

        let mut file = match self.file.take() {
            Some(file) => file,
            None => File::open(self.entry.file_path()).await?,
        };
        file.seek(SeekFrom::Start(self.position)).await?;
        let read = file.read(&mut buf[..wanted]).await?;
        self.file = Some(file);
        self.position += read as u64;
        Ok(read)
    }

    /// Fills `buf` completely.
    ///
    /// # Errors
    ///
    /// - `StreamingError::Io` - With `UnexpectedEof` if the file ends first
    /// - `StreamingError::SessionClosed` - If the session closes while waiting
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StreamingError> {
        let mut filled = 0;
        while filled < buf.len() {
            let read = self.read(&mut buf[filled..]).await?;
            if read == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            filled += read;
        }
        Ok(())
    }

    /// Turns the reader into a stream of chunks of at most `chunk_size` bytes,
    /// ending at end of file.
    pub fn into_chunks(
        self,
        chunk_size: usize,
    ) -> impl Stream<Item = Result<Vec<u8>, StreamingError>> {
        let chunk_size = chunk_size.max(1);
        futures::stream::try_unfold(self, move |mut reader| async move {
            let mut chunk = vec![0; chunk_size];
            let read = reader.read(&mut chunk).await?;
            if read == 0 {
                return Ok(None);
            }
            chunk.truncate(read);
            Ok(Some((chunk, reader)))
        })
    }

    async fn wait_for_piece(&mut self, piece: PieceIndex) -> Result<(), StreamingError> {
        let table = self.entry.table().clone();
        let mut announced = false;
        loop {
            // Register before checking so a completion in between still wakes us.
            let notified = table.notified();
            if table.is_finished(piece) {
                return Ok(());
            }
            if *self.lifecycle.borrow_and_update() == SessionState::Closed {
                return Err(StreamingError::SessionClosed);
            }
            if !announced {
                debug!(
                    "Waiting for piece {} of {}",
                    piece,
                    self.entry.relative_path()
                );
                announced = true;
            }
            self.entry.request_piece(piece);

            tokio::select! {
                _ = notified => {}
                changed = self.lifecycle.changed() => {
                    if changed.is_err() {
                        return Err(StreamingError::SessionClosed);
                    }
                }
                _ = tokio::time::sleep(self.fallback_tick) => {}
            }
        }
    }
}

impl std::fmt::Debug for TorrentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentReader")
            .field("file", &self.entry.relative_path())
            .field("position", &self.position)
            .field("length", &self.len())
            .finish()
    }
}
