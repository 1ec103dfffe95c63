//! Aggregate transfer statistics of a session.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

use crate::engine::NativeStats;

/// Aggregate transfer statistics.
///
/// Each counter is updated independently; readers may observe a rate from
/// one update next to a total from another.
#[derive(Debug, Default)]
pub struct DownloadStats {
    total_size: AtomicU64,
    downloaded_bytes: AtomicU64,
    uploaded_bytes: AtomicU64,
    download_rate: AtomicU64,
    upload_rate: AtomicU64,
    progress_bits: AtomicU32,
    finished: AtomicBool,
}

/// Point-in-time copy of [`DownloadStats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_size: u64,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub progress: f32,
    pub is_finished: bool,
}

impl DownloadStats {
    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::Relaxed)
    }

    pub fn download_rate(&self) -> u64 {
        self.download_rate.load(Ordering::Relaxed)
    }

    pub fn upload_rate(&self) -> u64 {
        self.upload_rate.load(Ordering::Relaxed)
    }

    pub fn progress(&self) -> f32 {
        f32::from_bits(self.progress_bits.load(Ordering::Relaxed))
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_size: self.total_size(),
            downloaded_bytes: self.downloaded_bytes(),
            uploaded_bytes: self.uploaded_bytes.load(Ordering::Relaxed),
            download_rate: self.download_rate(),
            upload_rate: self.upload_rate(),
            progress: self.progress(),
            is_finished: self.is_finished(),
        }
    }

    pub(super) fn set_total_size(&self, total_size: u64) {
        self.total_size.store(total_size, Ordering::Relaxed);
    }

    /// Derives downloaded bytes from the reported progress.
    pub(super) fn apply(&self, stats: &NativeStats) {
        let progress = stats.progress.clamp(0.0, 1.0);
        self.download_rate
            .store(stats.download_payload_rate, Ordering::Relaxed);
        self.upload_rate
            .store(stats.upload_payload_rate, Ordering::Relaxed);
        self.progress_bits
            .store(progress.to_bits(), Ordering::Relaxed);
        self.downloaded_bytes.store(
            (self.total_size() as f64 * progress as f64) as u64,
            Ordering::Relaxed,
        );
        self.uploaded_bytes
            .store(stats.total_payload_upload, Ordering::Relaxed);
        self.finished.store(stats.progress >= 1.0, Ordering::Relaxed);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downloaded_bytes_follow_progress() {
        let stats = DownloadStats::default();
        stats.set_total_size(1000);

        stats.apply(&NativeStats {
            download_payload_rate: 10,
            upload_payload_rate: 2,
            progress: 0.25,
            total_payload_upload: 7,
        });

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.downloaded_bytes, 250);
        assert_eq!(snapshot.uploaded_bytes, 7);
        assert_eq!(snapshot.download_rate, 10);
        assert!(!snapshot.is_finished);
    }

    #[test]
    fn test_progress_is_clamped_and_full_progress_finishes() {
        let stats = DownloadStats::default();
        stats.set_total_size(1000);

        stats.apply(&NativeStats {
            progress: 1.5,
            ..Default::default()
        });

        assert_eq!(stats.progress(), 1.0);
        assert_eq!(stats.downloaded_bytes(), 1000);
        assert!(stats.is_finished());
    }
}
