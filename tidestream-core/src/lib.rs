//! Tidestream Core - piece scheduling for watching torrents while they download
//!
//! This crate bridges a native BitTorrent engine to media playback: it maps
//! files onto pieces, keeps a window of urgent piece deadlines ahead of the
//! reader, and serves file bytes as soon as the pieces under them arrive.

pub mod config;
pub mod engine;
pub mod streaming;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::TidestreamConfig;
pub use engine::{EngineEvent, FilePriority, TorrentEngine};
pub use streaming::{StreamingError, TorrentReader};
pub use torrent::{TorrentError, TorrentFileHandle, TorrentSession};

/// Core errors that can bubble up from any Tidestream subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TidestreamError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamingError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TidestreamError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            TidestreamError::Torrent(e) => match e {
                TorrentError::InvalidGeometry { reason } => {
                    format!("Invalid torrent layout: {reason}")
                }
                TorrentError::ReloadFailed { reason } => {
                    format!("Could not load torrent metadata: {reason}")
                }
                TorrentError::SessionClosed => "Download was closed".to_string(),
                _ => "Download error occurred".to_string(),
            },
            TidestreamError::Streaming(e) => match e {
                StreamingError::SessionClosed => "Download was closed during playback".to_string(),
                StreamingError::InvalidSeek { position, length } => {
                    format!("Cannot seek to {position}, file has {length} bytes")
                }
                _ => "Streaming error occurred".to_string(),
            },
            TidestreamError::Configuration { reason } => format!("Configuration error: {reason}"),
            TidestreamError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            TidestreamError::Configuration { .. }
                | TidestreamError::Streaming(StreamingError::InvalidSeek { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, TidestreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors_are_classified() {
        let seek: TidestreamError = StreamingError::InvalidSeek {
            position: -1,
            length: 10,
        }
        .into();
        assert!(seek.is_user_error());
        assert_eq!(seek.user_message(), "Cannot seek to -1, file has 10 bytes");

        let closed: TidestreamError = TorrentError::SessionClosed.into();
        assert!(!closed.is_user_error());
        assert_eq!(closed.user_message(), "Download was closed");
    }
}
