//! Integration tests for torrent sessions.
//!
//! Drive a session through engine callbacks using the simulated engine and
//! check descriptor resolution, deferred replay, handles, and lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tempfile::TempDir;
use tidestream_core::config::TidestreamConfig;
use tidestream_core::engine::{
    EngineCommand, EngineEvent, FileLayout, FilePriority, NativeStats, SimulatedEngine,
    TorrentLayout, spawn_event_pump,
};
use tidestream_core::streaming::priority::FIRST_PIECE_DEADLINE;
use tidestream_core::torrent::{PieceIndex, PieceState, SessionState, TorrentError, TorrentSession};
use tokio::time::timeout;
use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok};

const MIB: u64 = 1024 * 1024;

/// Session over three files: pieces 0-3, 4-6, and 7 at 1 MiB per piece.
struct SessionFixture {
    engine: Arc<SimulatedEngine>,
    session: Arc<TorrentSession>,
    closed: Arc<AtomicUsize>,
    deleted: Arc<AtomicUsize>,
    _root: TempDir,
}

impl SessionFixture {
    fn new() -> Self {
        Self::with_engine(SimulatedEngine::new)
    }

    fn with_engine(build: impl FnOnce(TorrentLayout) -> SimulatedEngine) -> Self {
        let root = tempfile::tempdir().unwrap();
        let save_directory = root.path().join("torrent");
        let layout = TorrentLayout::from_files(
            MIB as u32,
            vec![
                FileLayout::new("show/ep1.mkv", 4 * MIB),
                FileLayout::new("show/ep2.mkv", 3 * MIB),
                FileLayout::new("show/ep2.srt", MIB),
            ],
        );
        let engine = Arc::new(build(layout).with_save_directory(&save_directory));
        let closed = Arc::new(AtomicUsize::new(0));
        let deleted = Arc::new(AtomicUsize::new(0));

        let session = {
            let closed = closed.clone();
            let deleted = deleted.clone();
            TorrentSession::new(
                "fixture",
                engine.clone(),
                &save_directory,
                TidestreamConfig::for_testing(),
            )
            .with_on_close(move |_| {
                closed.fetch_add(1, Ordering::SeqCst);
            })
            .with_on_delete(move |_| {
                deleted.fetch_add(1, Ordering::SeqCst);
            })
        };

        Self {
            engine,
            session: Arc::new(session),
            closed,
            deleted,
            _root: root,
        }
    }

    fn checked(self) -> Self {
        self.session.on_torrent_checked().unwrap();
        self
    }
}

#[tokio::test]
async fn test_get_files_waits_for_torrent_check() {
    let fixture = SessionFixture::new();
    let session = fixture.session.clone();
    let mut files = tokio_test::task::spawn(async move { session.get_files().await });

    assert_pending!(files.poll());
    assert_eq!(fixture.session.state(), SessionState::Starting);

    fixture.session.on_torrent_checked().unwrap();

    assert!(files.is_woken());
    let files = assert_ready_ok!(files.poll());
    assert_eq!(files.len(), 3);
    assert_eq!(files[1].relative_path(), "show/ep2.mkv");
    assert_eq!(files[1].piece_span(), 4..7);
    assert_eq!(files[1].offset(), 4 * MIB);
    assert_eq!(fixture.session.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_get_files_fails_once_closed() {
    let fixture = SessionFixture::new();
    let session = fixture.session.clone();
    let mut files = tokio_test::task::spawn(async move { session.get_files().await });

    assert_pending!(files.poll());
    fixture.session.close();

    let error = assert_ready_err!(files.poll());
    assert!(matches!(error, TorrentError::SessionClosed));
}

#[tokio::test]
async fn test_callbacks_before_check_are_replayed() {
    let fixture = SessionFixture::new();

    fixture.session.on_piece_downloading(PieceIndex::new(2));
    fixture.session.on_piece_finished(PieceIndex::new(5));
    assert!(fixture.session.descriptor_if_ready().is_none());

    fixture.session.on_torrent_checked().unwrap();

    let descriptor = fixture.session.descriptor_if_ready().unwrap();
    assert_eq!(descriptor.table().state(PieceIndex::new(2)), Some(PieceState::Downloading));
    assert!(descriptor.table().is_finished(PieceIndex::new(5)));
    assert_eq!(descriptor.entries()[1].downloaded_bytes(), MIB);
}

#[tokio::test]
async fn test_second_check_is_rejected() {
    let fixture = SessionFixture::new().checked();
    assert!(matches!(
        fixture.session.on_torrent_checked(),
        Err(TorrentError::AlreadyInitialized)
    ));
}

#[tokio::test]
async fn test_piece_finished_twice_counts_once() {
    let fixture = SessionFixture::new().checked();
    let files = fixture.session.get_files().await.unwrap();

    fixture.session.on_piece_finished(PieceIndex::new(5));
    fixture.session.on_piece_finished(PieceIndex::new(5));

    assert_eq!(files[1].downloaded_bytes(), MIB);
    assert_eq!(files[0].downloaded_bytes(), 0);
    assert!((files[1].progress() - 1.0 / 3.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_file_completed_marks_whole_file() {
    let fixture = SessionFixture::new().checked();
    let files = fixture.session.get_files().await.unwrap();

    fixture.session.on_file_completed(1);
    fixture.session.on_file_completed(99);

    assert_eq!(files[1].downloaded_bytes(), 3 * MIB);
    assert!(files[1].is_finished());
    assert_eq!(files[1].progress(), 1.0);
    // Piece states are left alone.
    assert!(!files[1].table().is_finished(PieceIndex::new(4)));
}

#[tokio::test]
async fn test_concurrent_close_runs_hook_once() {
    let fixture = SessionFixture::new().checked();

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let session = fixture.session.clone();
            std::thread::spawn(move || session.close())
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(fixture.closed.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_delete_waits_for_last_handle() {
    let fixture = SessionFixture::new().checked();
    let files = fixture.session.get_files().await.unwrap();
    tokio::fs::create_dir_all(fixture.session.save_directory())
        .await
        .unwrap();

    let first = files[0].create_handle().unwrap();
    let second = files[1].create_handle().unwrap();

    assert!(!first.close_and_delete().await.unwrap());
    assert!(!fixture.session.is_closed());
    assert!(fixture.session.save_directory().exists());

    assert!(second.close_and_delete().await.unwrap());
    assert!(fixture.session.is_closed());
    assert!(!fixture.session.save_directory().exists());
    assert_eq!(fixture.closed.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.deleted.load(Ordering::SeqCst), 1);

    // Only the first deletion counts.
    assert!(!fixture.session.delete_entire_torrent_if_not_in_use().await.unwrap());
}

#[tokio::test]
async fn test_delete_requires_closed_session() {
    let fixture = SessionFixture::new().checked();
    assert!(!fixture.session.delete_entire_torrent_if_not_in_use().await.unwrap());
    assert_eq!(fixture.deleted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_dropping_last_handle_closes_session() {
    let fixture = SessionFixture::new().checked();
    let files = fixture.session.get_files().await.unwrap();

    let handle = files[2].create_handle().unwrap();
    assert_eq!(fixture.session.open_handle_count(), 1);
    drop(handle);

    assert_eq!(fixture.session.open_handle_count(), 0);
    assert!(fixture.session.is_closed());
    assert!(matches!(
        files[2].create_handle(),
        Err(TorrentError::SessionClosed)
    ));
}

#[tokio::test]
async fn test_resume_sets_priority_then_window_then_resumes() {
    let fixture = SessionFixture::new().checked();
    let files = fixture.session.get_files().await.unwrap();
    let handle = files[1].create_handle().unwrap();
    fixture.engine.take_commands();

    handle.resume(FilePriority::High).unwrap();

    let commands = fixture.engine.take_commands();
    assert_eq!(
        commands.first(),
        Some(&EngineCommand::SetFilePriority(1, FilePriority::High))
    );
    assert_eq!(
        commands.get(1),
        Some(&EngineCommand::SetPieceDeadline(PieceIndex::new(4), FIRST_PIECE_DEADLINE))
    );
    assert_eq!(commands.last(), Some(&EngineCommand::Resume));
    let deadlines = commands
        .iter()
        .filter(|command| matches!(command, EngineCommand::SetPieceDeadline(..)))
        .count();
    assert_eq!(deadlines, 3);
    assert!(!fixture.engine.is_paused());
}

#[tokio::test]
async fn test_engine_not_resumed_without_handle() {
    let fixture = SessionFixture::new().checked();
    fixture.session.on_piece_finished(PieceIndex::new(0));
    fixture.session.on_torrent_finished();

    assert!(!fixture.engine.commands().contains(&EngineCommand::Resume));
    assert!(fixture.engine.is_paused());
}

#[tokio::test]
async fn test_finished_piece_slides_open_window() {
    let fixture = SessionFixture::new().checked();
    let files = fixture.session.get_files().await.unwrap();
    let handle = files[0].create_handle().unwrap();
    handle.resume(FilePriority::Normal).unwrap();
    let before = files[0].current_window();
    fixture.engine.take_commands();

    fixture.session.on_piece_finished(before[0]);

    let after = files[0].current_window();
    assert!(!after.contains(&before[0]));
    // Nothing outside the file's own span is requested.
    assert!(after.iter().all(|piece| piece.as_u32() < 4));
}

#[tokio::test]
async fn test_stats_update_derives_downloaded_bytes() {
    let fixture = SessionFixture::new().checked();

    fixture.session.on_stats_update(&NativeStats {
        download_payload_rate: 2048,
        upload_payload_rate: 16,
        progress: 0.5,
        total_payload_upload: 100,
    });

    let stats = fixture.session.stats().snapshot();
    assert_eq!(stats.total_size, 8 * MIB);
    assert_eq!(stats.downloaded_bytes, 4 * MIB);
    assert_eq!(stats.download_rate, 2048);
    assert!(!stats.is_finished);
    assert_eq!(fixture.session.state(), SessionState::Ready);

    fixture.session.on_stats_update(&NativeStats {
        progress: 1.0,
        ..Default::default()
    });
    assert!(fixture.session.stats().is_finished());
    assert_eq!(fixture.session.state(), SessionState::Finished);

    let json = serde_json::to_value(fixture.session.stats().snapshot()).unwrap();
    assert_eq!(json["is_finished"], true);
}

#[tokio::test]
async fn test_torrent_finished_requests_resume_data() {
    let fixture = SessionFixture::new().checked();
    fixture.session.on_torrent_finished();
    assert!(fixture.engine.commands().contains(&EngineCommand::PostSaveResume));
}

#[tokio::test]
async fn test_save_resume_data_writes_blob() {
    let fixture = SessionFixture::new();
    fixture.session.on_save_resume_data(b"resume").await.unwrap();

    let written = tokio::fs::read(fixture.session.fast_resume_file()).await.unwrap();
    assert_eq!(written, b"resume");
    assert!(fixture.session.fast_resume_file().ends_with("fastresume"));
}

#[tokio::test]
async fn test_housekeeping_stops_after_close() {
    let fixture = SessionFixture::new().checked();
    fixture.session.start_housekeeping();

    tokio::time::sleep(Duration::from_millis(60)).await;
    let count_updates = || {
        fixture
            .engine
            .commands()
            .iter()
            .filter(|command| **command == EngineCommand::PostStatusUpdates)
            .count()
    };
    assert!(count_updates() >= 2);

    fixture.session.close();
    let after_close = count_updates();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(count_updates(), after_close);
}

#[tokio::test]
async fn test_pump_applies_events_in_order() {
    let fixture = SessionFixture::new();
    let (events, _pump) = spawn_event_pump(fixture.session.clone());

    events.send(EngineEvent::PieceFinished(PieceIndex::new(7)));
    events.send(EngineEvent::TorrentChecked);

    let files = timeout(Duration::from_secs(1), fixture.session.get_files())
        .await
        .unwrap()
        .unwrap();
    assert!(files[2].is_finished());
}

#[tokio::test]
async fn test_reload_failure_closes_session() {
    let fixture = SessionFixture::with_engine(|layout| SimulatedEngine::new(layout).with_reload_failure());
    let (events, pump) = spawn_event_pump(fixture.session.clone());

    events.send(EngineEvent::TorrentChecked);

    let result = timeout(Duration::from_secs(1), fixture.session.get_files())
        .await
        .unwrap();
    assert!(matches!(result, Err(TorrentError::SessionClosed)));
    timeout(Duration::from_secs(1), pump).await.unwrap().unwrap();
    assert_eq!(fixture.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalid_layout_closes_session() {
    let fixture = SessionFixture::with_engine(|_| {
        SimulatedEngine::new(TorrentLayout {
            piece_count: 2,
            piece_length: 10,
            last_piece_size: 10,
            files: vec![FileLayout::new("short.bin", 100)],
        })
    });
    let (events, pump) = spawn_event_pump(fixture.session.clone());

    events.send(EngineEvent::PieceFinished(PieceIndex::new(0)));
    events.send(EngineEvent::TorrentChecked);

    let result = timeout(Duration::from_secs(1), fixture.session.get_files())
        .await
        .unwrap();
    assert!(matches!(result, Err(TorrentError::SessionClosed)));
    assert!(fixture.session.descriptor_if_ready().is_none());
    timeout(Duration::from_secs(1), pump).await.unwrap().unwrap();
    assert_eq!(fixture.closed.load(Ordering::SeqCst), 1);

    // Callbacks after close are dropped rather than queued.
    fixture.session.on_piece_finished(PieceIndex::new(1));
    assert_eq!(fixture.session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_handle_never_outlives_close_if_not_in_use() {
    let fixture = SessionFixture::new().checked();
    let files = fixture.session.get_files().await.unwrap();

    let closer = {
        let session = fixture.session.clone();
        std::thread::spawn(move || {
            while !session.close_if_not_in_use() {
                std::thread::yield_now();
            }
        })
    };
    let openers: Vec<_> = (0..4)
        .map(|index| {
            let session = fixture.session.clone();
            let entry = files[index % files.len()].clone();
            std::thread::spawn(move || {
                let mut violations = 0;
                while let Ok(handle) = entry.create_handle() {
                    if session.is_closed() {
                        violations += 1;
                    }
                    drop(handle);
                }
                violations
            })
        })
        .collect();

    closer.join().unwrap();
    for opener in openers {
        assert_eq!(opener.join().unwrap(), 0);
    }
    assert!(fixture.session.is_closed());
    assert_eq!(fixture.session.open_handle_count(), 0);
    assert_eq!(fixture.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_delete_can_be_retried() {
    let fixture = SessionFixture::new().checked();
    let save_directory = fixture.session.save_directory().to_path_buf();
    // A plain file where the data directory should be makes removal fail.
    std::fs::write(&save_directory, b"not a directory").unwrap();
    fixture.session.close();

    assert!(matches!(
        fixture.session.delete_entire_torrent_if_not_in_use().await,
        Err(TorrentError::Io(_))
    ));
    assert_eq!(fixture.deleted.load(Ordering::SeqCst), 0);

    std::fs::remove_file(&save_directory).unwrap();
    std::fs::create_dir_all(save_directory.join("show")).unwrap();

    assert!(fixture.session.delete_entire_torrent_if_not_in_use().await.unwrap());
    assert!(!save_directory.exists());
    assert_eq!(fixture.deleted.load(Ordering::SeqCst), 1);
}
