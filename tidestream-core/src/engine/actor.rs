//! Event pump that applies engine callbacks to a session.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::EngineEvent;
use crate::torrent::{SessionState, TorrentError, TorrentSession};

/// Cloneable sender the engine uses to report events.
///
/// Sending never blocks, so it is safe to call from engine threads.
#[derive(Debug, Clone)]
pub struct EngineEventSender {
    sender: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineEventSender {
    pub(crate) fn from_unbounded(sender: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { sender }
    }

    /// Queues an event. Returns false once the pump has stopped.
    pub fn send(&self, event: EngineEvent) -> bool {
        self.sender.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Spawns the task that feeds engine events to `session` in arrival order.
///
/// The pump stops when the session closes or every sender is dropped.
/// A failed metadata reload or an inconsistent layout closes the session,
/// since nothing can be streamed without a descriptor.
///
/// # Examples
/// ```rust,no_run
/// # #[tokio::main]
/// # async fn main() {
/// use std::sync::Arc;
/// use tidestream_core::config::TidestreamConfig;
/// use tidestream_core::engine::{EngineEvent, FileLayout, SimulatedEngine, TorrentLayout, spawn_event_pump};
/// use tidestream_core::torrent::TorrentSession;
///
/// let layout = TorrentLayout::from_files(1 << 20, vec![FileLayout::new("movie.mkv", 8 << 20)]);
/// let engine = Arc::new(SimulatedEngine::new(layout));
/// let session = Arc::new(TorrentSession::new("demo", engine, "downloads/demo", TidestreamConfig::default()));
/// let (events, _pump) = spawn_event_pump(session.clone());
/// events.send(EngineEvent::TorrentChecked);
/// let files = session.get_files().await.unwrap();
/// # }
/// ```
pub fn spawn_event_pump(session: Arc<TorrentSession>) -> (EngineEventSender, JoinHandle<()>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        run_event_loop(session, receiver).await;
    });
    (EngineEventSender::from_unbounded(sender), task)
}

async fn run_event_loop(
    session: Arc<TorrentSession>,
    mut receiver: mpsc::UnboundedReceiver<EngineEvent>,
) {
    debug!("[{}] Engine event pump started", session.id());
    let mut lifecycle = session.subscribe_state();

    loop {
        if *lifecycle.borrow_and_update() == SessionState::Closed {
            break;
        }
        tokio::select! {
            event = receiver.recv() => match event {
                Some(event) => handle_event(&session, event).await,
                None => break,
            },
            changed = lifecycle.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!("[{}] Engine event pump stopped", session.id());
}

async fn handle_event(session: &Arc<TorrentSession>, event: EngineEvent) {
    match event {
        EngineEvent::TorrentChecked => match session.on_torrent_checked() {
            Ok(()) => {}
            Err(e @ (TorrentError::ReloadFailed { .. } | TorrentError::InvalidGeometry { .. })) => {
                error!("[{}] {}; closing session", session.id(), e);
                session.close();
            }
            Err(e) => error!("[{}] Failed to initialize torrent: {}", session.id(), e),
        },
        EngineEvent::PieceDownloading(piece) => session.on_piece_downloading(piece),
        EngineEvent::PieceFinished(piece) => session.on_piece_finished(piece),
        EngineEvent::FileCompleted(index) => session.on_file_completed(index),
        EngineEvent::TorrentFinished => session.on_torrent_finished(),
        EngineEvent::StatsUpdate(stats) => session.on_stats_update(&stats),
        EngineEvent::SaveResumeData(data) => {
            if let Err(e) = session.on_save_resume_data(&data).await {
                warn!("[{}] Failed to save resume data: {}", session.id(), e);
            }
        }
    }
}
