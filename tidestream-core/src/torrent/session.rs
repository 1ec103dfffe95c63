//! Download session for a single torrent.
//!
//! The session owns the engine handle, builds the [`TorrentDescriptor`] once
//! the engine has checked local data, and routes engine callbacks to the
//! per-file download controllers. Callbacks that arrive before the descriptor
//! exists are buffered in a [`DeferredQueue`] and replayed in order exactly
//! once when it is published.

use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::deferred::DeferredQueue;
use super::file::{TorrentFileEntry, TorrentFileHandle};
use super::file_mapper::map_file_pieces;
use super::piece::PieceTable;
use super::stats::DownloadStats;
use super::{PieceIndex, TorrentError};
use crate::config::TidestreamConfig;
use crate::engine::{NativeStats, TorrentEngine, TorrentLayout};
use crate::streaming::DownloadController;
use crate::streaming::priority::{EngineDeadlines, PiecePriorities};

/// Lifecycle of a session. Only ever advances; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SessionState {
    /// Waiting for the engine to check data and report metadata
    Starting,
    /// Descriptor published, files addressable
    Ready,
    /// Engine reported full progress
    Finished,
    Closed,
}

/// Callback invoked with the session on close or delete.
pub type SessionHook = Box<dyn Fn(&TorrentSession) + Send + Sync>;

type DeferredTask = Box<dyn FnOnce(&TorrentSession, &TorrentDescriptor) + Send>;

/// Resolved metadata of a torrent: piece table and file layout.
pub struct TorrentDescriptor {
    table: Arc<PieceTable>,
    piece_length: u32,
    entries: Vec<Arc<TorrentFileEntry>>,
}

impl TorrentDescriptor {
    pub fn table(&self) -> &Arc<PieceTable> {
        &self.table
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn entries(&self) -> &[Arc<TorrentFileEntry>] {
        &self.entries
    }
}

impl fmt::Debug for TorrentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TorrentDescriptor(pieces={}, entries={})",
            self.table.len(),
            self.entries.len()
        )
    }
}

#[derive(Default)]
struct HandleRegistry {
    /// (handle id, file index)
    open: Vec<(u64, usize)>,
    next_id: u64,
    closed: bool,
    deleted: bool,
}

/// Bridges one engine torrent handle to per-file download controllers.
pub struct TorrentSession {
    id: String,
    engine: Arc<dyn TorrentEngine>,
    save_directory: PathBuf,
    fast_resume_file: PathBuf,
    config: TidestreamConfig,
    state: watch::Sender<SessionState>,
    descriptor: watch::Sender<Option<Arc<TorrentDescriptor>>>,
    deferred: DeferredQueue<DeferredTask>,
    stats: DownloadStats,
    handles: Mutex<HandleRegistry>,
    housekeeping: Mutex<Option<JoinHandle<()>>>,
    on_close: Option<SessionHook>,
    on_delete: Option<SessionHook>,
}

impl TorrentSession {
    /// Creates a session whose data lives under `save_directory`.
    ///
    /// The resume blob defaults to `save_directory/<resume_file_name>`.
    pub fn new(
        id: impl Into<String>,
        engine: Arc<dyn TorrentEngine>,
        save_directory: impl Into<PathBuf>,
        config: TidestreamConfig,
    ) -> Self {
        let save_directory = save_directory.into();
        let fast_resume_file = save_directory.join(config.session.resume_file_name);
        Self {
            id: id.into(),
            engine,
            save_directory,
            fast_resume_file,
            config,
            state: watch::Sender::new(SessionState::Starting),
            descriptor: watch::Sender::new(None),
            deferred: DeferredQueue::new(),
            stats: DownloadStats::default(),
            handles: Mutex::new(HandleRegistry::default()),
            housekeeping: Mutex::new(None),
            on_close: None,
            on_delete: None,
        }
    }

    pub fn with_fast_resume_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.fast_resume_file = path.into();
        self
    }

    /// Hook run once, after the session closes.
    pub fn with_on_close(mut self, hook: impl Fn(&TorrentSession) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    /// Hook run once, after the data directory has been deleted.
    pub fn with_on_delete(mut self, hook: impl Fn(&TorrentSession) + Send + Sync + 'static) -> Self {
        self.on_delete = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn save_directory(&self) -> &Path {
        &self.save_directory
    }

    pub fn fast_resume_file(&self) -> &Path {
        &self.fast_resume_file
    }

    pub(super) fn engine(&self) -> &Arc<dyn TorrentEngine> {
        &self.engine
    }

    pub fn config(&self) -> &TidestreamConfig {
        &self.config
    }

    pub fn stats(&self) -> &DownloadStats {
        &self.stats
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver that observes every lifecycle transition.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn open_handle_count(&self) -> usize {
        self.handles.lock().open.len()
    }

    /// Descriptor if already resolved; never waits.
    pub fn descriptor_if_ready(&self) -> Option<Arc<TorrentDescriptor>> {
        self.descriptor.borrow().clone()
    }

    /// Waits until the descriptor is resolved.
    ///
    /// # Errors
    ///
    /// - `TorrentError::SessionClosed` - If the session closes first
    pub async fn descriptor(&self) -> Result<Arc<TorrentDescriptor>, TorrentError> {
        let mut descriptor = self.descriptor.subscribe();
        let mut state = self.state.subscribe();
        loop {
            if let Some(resolved) = descriptor.borrow_and_update().clone() {
                return Ok(resolved);
            }
            if *state.borrow_and_update() == SessionState::Closed {
                return Err(TorrentError::SessionClosed);
            }
            tokio::select! {
                _ = descriptor.changed() => {}
                _ = state.changed() => {}
            }
        }
    }

    /// Waits for metadata and returns every file of the torrent.
    ///
    /// # Errors
    ///
    /// - `TorrentError::SessionClosed` - If the session closes first
    pub async fn get_files(&self) -> Result<Vec<Arc<TorrentFileEntry>>, TorrentError> {
        Ok(self.descriptor().await?.entries.clone())
    }

    /// Starts the periodic status update request.
    pub fn start_housekeeping(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let session = Arc::downgrade(self);
        let interval = self.config.session.status_update_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(session) = session.upgrade() else {
                    break;
                };
                if session.is_closed() || !session.engine.is_valid() {
                    break;
                }
                session.engine.post_status_updates();
            }
        });
        if let Some(previous) = self.housekeeping.lock().replace(task) {
            previous.abort();
        }
    }

    /// Engine finished checking local data; builds the descriptor.
    ///
    /// # Errors
    ///
    /// - `TorrentError::ReloadFailed` - If the engine cannot reload metadata
    /// - `TorrentError::InvalidGeometry` - If the reported layout is inconsistent
    /// - `TorrentError::AlreadyInitialized` - If called after a successful build
    pub fn on_torrent_checked(self: &Arc<Self>) -> Result<(), TorrentError> {
        info!("[{}] Torrent checked", self.id);
        if self.is_closed() {
            debug!("[{}] Ignoring check result of closed session", self.id);
            return Ok(());
        }
        let layout = self.engine.reload_file().map_err(|reason| {
            error!("[{}] Reload file failed: {}", self.id, reason);
            TorrentError::ReloadFailed { reason }
        })?;
        self.initialize_descriptor(layout)
    }

    pub fn on_piece_downloading(&self, piece: PieceIndex) {
        self.with_descriptor(move |_, descriptor| {
            descriptor.table.mark_downloading(piece);
        });
    }

    /// The engine may skip this event for pieces restored from resume data.
    pub fn on_piece_finished(&self, piece: PieceIndex) {
        self.with_descriptor(move |session, descriptor| {
            session.apply_piece_finished(descriptor, piece);
        });
    }

    /// Marks a whole file downloaded without touching piece states, since
    /// boundary pieces shared with a neighbour may still be incomplete.
    pub fn on_file_completed(&self, file_index: usize) {
        self.with_descriptor(move |session, descriptor| {
            match descriptor.entries.get(file_index) {
                Some(entry) => entry.downloaded_bytes.store(entry.length, Ordering::Release),
                None => warn!("[{}] Completed file {} does not exist", session.id, file_index),
            }
        });
    }

    /// Not a completeness signal: the engine reports this as soon as it has
    /// nothing more it wants to fetch, including right after creation.
    pub fn on_torrent_finished(&self) {
        info!("[{}] Torrent finished", self.id);
        if !self.is_closed() {
            self.engine.post_save_resume();
        }
    }

    pub fn on_stats_update(&self, stats: &NativeStats) {
        self.stats.apply(stats);
        if stats.progress >= 1.0 {
            self.advance_state(SessionState::Finished);
        }
    }

    /// Persists an opaque resume blob.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - If the blob cannot be written
    pub async fn on_save_resume_data(&self, data: &[u8]) -> Result<(), TorrentError> {
        info!(
            "[{}] Saving resume data to: {}",
            self.id,
            self.fast_resume_file.display()
        );
        if let Some(parent) = self.fast_resume_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.fast_resume_file, data).await?;
        Ok(())
    }

    /// Closes the session. Only the first call has any effect.
    pub fn close(&self) {
        {
            let mut handles = self.handles.lock();
            if handles.closed {
                return;
            }
            handles.closed = true;
        }
        self.teardown();
    }

    /// Closes the session if no file handle is open. Returns true if closed.
    ///
    /// The handle check and the close flag share one lock, so a handle
    /// registered concurrently either prevents the close or is refused.
    pub fn close_if_not_in_use(&self) -> bool {
        {
            let mut handles = self.handles.lock();
            if !handles.open.is_empty() {
                return false;
            }
            if handles.closed {
                return true;
            }
            handles.closed = true;
        }
        self.teardown();
        true
    }

    /// Runs once, after `closed` has been set under the handle lock.
    fn teardown(&self) {
        info!("[{}] Session closing", self.id);
        self.advance_state(SessionState::Closed);
        if let Some(task) = self.housekeeping.lock().take() {
            task.abort();
        }
        match self.descriptor_if_ready() {
            Some(descriptor) => descriptor.table.wake_all(),
            None => {
                if let Ok(dropped) = self.deferred.drain_and_dispose() {
                    debug!(
                        "[{}] Dropped {} callbacks queued before metadata",
                        self.id,
                        dropped.len()
                    );
                }
            }
        }
        if let Some(hook) = &self.on_close {
            hook(self);
        }
    }

    /// Deletes all downloaded data once the session is closed and unused.
    ///
    /// Returns false without touching disk while any handle is open or the
    /// session is still running. A failed removal may be retried.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - If the data directory cannot be removed
    pub async fn delete_entire_torrent_if_not_in_use(&self) -> Result<bool, TorrentError> {
        {
            let mut handles = self.handles.lock();
            if !handles.open.is_empty() || !handles.closed || handles.deleted {
                return Ok(false);
            }
            handles.deleted = true;
        }
        info!(
            "[{}] Deleting torrent data: {}",
            self.id,
            self.save_directory.display()
        );
        match tokio::fs::remove_dir_all(&self.save_directory).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                self.handles.lock().deleted = false;
                return Err(e.into());
            }
        }
        if let Some(hook) = &self.on_delete {
            hook(self);
        }
        Ok(true)
    }

    fn advance_state(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
    }

    /// Runs `task` now if the descriptor exists, otherwise queues it.
    fn with_descriptor<F>(&self, task: F)
    where
        F: FnOnce(&TorrentSession, &TorrentDescriptor) + Send + 'static,
    {
        if let Some(descriptor) = self.descriptor_if_ready() {
            task(self, &descriptor);
            return;
        }
        if let Err(task) = self.deferred.push(Box::new(task)) {
            // Disposed either after publishing or by closing without metadata.
            match self.descriptor_if_ready() {
                Some(descriptor) => task(self, &descriptor),
                None => debug!("[{}] Dropping callback for closed session", self.id),
            }
        }
    }

    fn initialize_descriptor(self: &Arc<Self>, layout: TorrentLayout) -> Result<(), TorrentError> {
        if self.descriptor.borrow().is_some() {
            return Err(TorrentError::AlreadyInitialized);
        }

        let table = Arc::new(PieceTable::build(
            layout.piece_count,
            layout.piece_length,
            layout.last_piece_size,
        )?);
        let priorities: Arc<dyn PiecePriorities> = Arc::new(EngineDeadlines::new(
            self.engine.clone(),
            self.state.subscribe(),
            self.id.clone(),
        ));

        let mut offset = 0u64;
        let mut entries = Vec::with_capacity(layout.files.len());
        for (index, file) in layout.files.iter().enumerate() {
            let span = map_file_pieces(&table, offset, file.size)?;
            let relative_path = file.relative_path().to_string();
            log_pieces(&self.id, &table, &span, &relative_path);

            let controller = DownloadController::new(
                table.clone(),
                span.clone(),
                priorities.clone(),
                &self.config.scheduler,
            );
            entries.push(Arc::new(TorrentFileEntry {
                index,
                offset,
                length: file.size,
                downloaded_bytes: AtomicU64::new(table.finished_bytes(&span).min(file.size)),
                relative_path,
                save_directory: self.save_directory.clone(),
                span,
                table: table.clone(),
                controller: Mutex::new(controller),
                engine: self.engine.clone(),
                lifecycle: self.state.subscribe(),
                session: Arc::downgrade(self),
                torrent_id: self.id.clone(),
            }));
            offset += file.size;
        }

        let descriptor = Arc::new(TorrentDescriptor {
            table,
            piece_length: layout.piece_length,
            entries,
        });
        info!("[{}] Got torrent info: {:?}", self.id, descriptor);
        self.stats.set_total_size(offset);

        let published = self.descriptor.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(descriptor.clone());
            true
        });
        if !published {
            return Err(TorrentError::AlreadyInitialized);
        }
        self.advance_state(SessionState::Ready);

        // Empty if a concurrent close already dropped the queue.
        let tasks = self.deferred.drain_and_dispose().unwrap_or_default();
        if !tasks.is_empty() {
            debug!("[{}] Replaying {} deferred callbacks", self.id, tasks.len());
        }
        for task in tasks {
            task(self, &descriptor);
        }
        Ok(())
    }

    fn apply_piece_finished(&self, descriptor: &TorrentDescriptor, piece: PieceIndex) {
        if descriptor.table.get(piece).is_none() {
            warn!("[{}] Finished piece {} out of range", self.id, piece);
            return;
        }
        descriptor.table.mark_finished(piece);

        for entry in self.open_entries(descriptor) {
            if entry.contains_piece(piece) {
                entry.controller.lock().on_piece_downloaded(piece);
            }
        }
        for entry in &descriptor.entries {
            if entry.contains_piece(piece) {
                entry.refresh_downloaded_bytes();
            }
        }
    }

    /// Entries with at least one open handle.
    fn open_entries<'a>(&self, descriptor: &'a TorrentDescriptor) -> Vec<&'a Arc<TorrentFileEntry>> {
        let mut indices: Vec<usize> = self
            .handles
            .lock()
            .open
            .iter()
            .map(|(_, file)| *file)
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices
            .into_iter()
            .filter_map(|index| descriptor.entries.get(index))
            .collect()
    }

    pub(super) fn register_handle(
        self: &Arc<Self>,
        entry: Arc<TorrentFileEntry>,
    ) -> Result<TorrentFileHandle, TorrentError> {
        let id = {
            let mut handles = self.handles.lock();
            if handles.closed {
                return Err(TorrentError::SessionClosed);
            }
            let id = handles.next_id;
            handles.next_id += 1;
            handles.open.push((id, entry.index));
            id
        };
        debug!("[{}] Opened handle {} for {}", self.id, id, entry.relative_path);
        Ok(TorrentFileHandle {
            id,
            session: self.clone(),
            entry,
            closed: AtomicBool::new(false),
        })
    }

    pub(super) fn release_handle(&self, id: u64) {
        self.handles.lock().open.retain(|(open_id, _)| *open_id != id);
        debug!("[{}] Closed handle {}", self.id, id);
        self.close_if_not_in_use();
    }
}

impl fmt::Debug for TorrentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TorrentSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("save_directory", &self.save_directory)
            .finish()
    }
}

fn log_pieces(torrent_id: &str, table: &PieceTable, span: &Range<u32>, path: &str) {
    let pieces = table.span(span);
    match (pieces.first(), pieces.last()) {
        (Some(first), Some(last)) => info!(
            "[{}] File '{}' piece initialized, {} pieces, index range: {}..={}, offset range: {}..{}",
            torrent_id,
            path,
            pieces.len(),
            first.index(),
            last.index(),
            first.offset(),
            last.end()
        ),
        _ => info!("[{}] File '{}' piece initialized, no pieces", torrent_id, path),
    }
}
