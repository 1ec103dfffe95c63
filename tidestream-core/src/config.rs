//! Centralized configuration for Tidestream.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Central configuration for all Tidestream components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct TidestreamConfig {
    pub scheduler: SchedulerConfig,
    pub session: SessionConfig,
    pub reader: ReaderConfig,
}

/// Piece window and metadata sizing for download controllers.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Bytes the window should cover; divided by piece size for the window length.
    /// Engines may spread requests evenly over the whole window, so keep it small.
    pub window_budget: u64,
    /// Lower bound on window length in pieces
    pub min_window_pieces: usize,
    /// Upper bound on window length in pieces
    pub max_window_pieces: usize,
    /// Leading bytes treated as container header
    pub header_size: u64,
    /// Trailing bytes requested together with the window
    pub footer_size: u64,
    /// Trailing bytes whose pieces are ranked by distance to the file end
    pub possible_footer_size: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            window_budget: 8 * MIB,
            min_window_pieces: 2,
            max_window_pieces: 64,
            header_size: 2 * MIB,
            footer_size: MIB / 2,
            possible_footer_size: 8 * MIB,
        }
    }
}

impl SchedulerConfig {
    /// Window length in pieces for a given piece size.
    pub fn window_size(&self, piece_size: u64) -> usize {
        let pieces = self.window_budget / piece_size.max(1);
        (pieces.min(usize::MAX as u64) as usize)
            .clamp(self.min_window_pieces, self.max_window_pieces)
    }
}

/// Session housekeeping and persistence settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How often the engine is asked for fresh statistics
    pub status_update_interval: Duration,
    /// File name of the resume blob inside the torrent's data directory
    pub resume_file_name: &'static str,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            status_update_interval: Duration::from_secs(1),
            resume_file_name: "fastresume",
        }
    }
}

/// Streaming reader settings.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Re-check interval while waiting for a piece, in case a wakeup is missed
    pub fallback_tick: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            fallback_tick: Duration::from_secs(1),
        }
    }
}

impl TidestreamConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(budget) = std::env::var("TIDESTREAM_WINDOW_BUDGET") {
            if let Ok(bytes) = budget.parse::<u64>() {
                config.scheduler.window_budget = bytes;
            }
        }

        if let Ok(interval) = std::env::var("TIDESTREAM_STATUS_INTERVAL_MS") {
            if let Ok(millis) = interval.parse::<u64>() {
                config.session.status_update_interval = Duration::from_millis(millis);
            }
        }

        if let Ok(tick) = std::env::var("TIDESTREAM_READER_TICK_MS") {
            if let Ok(millis) = tick.parse::<u64>() {
                config.reader.fallback_tick = Duration::from_millis(millis);
            }
        }

        config
    }

    /// Creates a configuration optimized for testing.
    pub fn for_testing() -> Self {
        Self {
            session: SessionConfig {
                status_update_interval: Duration::from_millis(10),
                ..Default::default()
            },
            reader: ReaderConfig {
                fallback_tick: Duration::from_millis(50),
            },
            ..Default::default()
        }
    }
}
