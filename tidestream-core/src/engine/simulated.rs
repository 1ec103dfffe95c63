//! In-process engine for tests and offline demos.
//!
//! Records every command, keeps the deadline table, and "downloads" the most
//! urgent piece on demand by writing deterministic bytes to disk. Events are
//! reported through an attached [`EngineEventSender`].

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use super::{EngineEvent, EngineEventSender, FilePriority, NativeStats, TorrentEngine, TorrentLayout};
use crate::torrent::PieceIndex;

/// Command received by [`SimulatedEngine`], in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    SetPieceDeadline(PieceIndex, i32),
    ClearPieceDeadlines,
    SetFilePriority(usize, FilePriority),
    Resume,
    Pause,
    PostStatusUpdates,
    ReloadFile,
    PostSaveResume,
}

#[derive(Default)]
struct SimulatedState {
    commands: Vec<EngineCommand>,
    deadlines: BTreeMap<u32, i32>,
    finished: Vec<bool>,
    paused: bool,
}

/// Byte written at an absolute torrent offset.
pub fn simulated_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// Deterministic engine with no network.
pub struct SimulatedEngine {
    layout: TorrentLayout,
    save_directory: Option<PathBuf>,
    state: Mutex<SimulatedState>,
    events: Mutex<Option<EngineEventSender>>,
    fail_reload: AtomicBool,
    valid: AtomicBool,
}

impl SimulatedEngine {
    /// Creates a paused engine for `layout` that keeps data in memory only.
    pub fn new(layout: TorrentLayout) -> Self {
        let state = SimulatedState {
            finished: vec![false; layout.piece_count as usize],
            paused: true,
            ..Default::default()
        };
        Self {
            layout,
            save_directory: None,
            state: Mutex::new(state),
            events: Mutex::new(None),
            fail_reload: AtomicBool::new(false),
            valid: AtomicBool::new(true),
        }
    }

    /// Writes downloaded pieces under `directory`.
    pub fn with_save_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.save_directory = Some(directory.into());
        self
    }

    /// Makes the next metadata reloads fail.
    pub fn with_reload_failure(self) -> Self {
        self.fail_reload.store(true, Ordering::Relaxed);
        self
    }

    /// Routes engine events to a session's event pump.
    pub fn attach(&self, events: EngineEventSender) {
        *self.events.lock() = Some(events);
    }

    pub fn layout(&self) -> &TorrentLayout {
        &self.layout
    }

    pub fn commands(&self) -> Vec<EngineCommand> {
        self.state.lock().commands.clone()
    }

    /// Returns and forgets the recorded commands.
    pub fn take_commands(&self) -> Vec<EngineCommand> {
        std::mem::take(&mut self.state.lock().commands)
    }

    /// Current deadline of every prioritized piece.
    pub fn deadlines(&self) -> BTreeMap<u32, i32> {
        self.state.lock().deadlines.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn finished_count(&self) -> usize {
        self.state.lock().finished.iter().filter(|done| **done).count()
    }

    /// Marks the native handle as gone.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Relaxed);
    }

    /// Reports an event as the native engine would.
    pub fn emit(&self, event: EngineEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            events.send(event);
        }
    }

    /// Downloads the most urgent unfinished piece.
    ///
    /// Pieces with deadlines go first, lowest deadline then lowest index.
    /// Without deadlines the lowest unfinished index is taken. Returns `None`
    /// while paused or once everything is finished.
    ///
    /// # Errors
    ///
    /// Returns an error if piece data cannot be written.
    pub async fn download_next(&self) -> std::io::Result<Option<PieceIndex>> {
        let Some(piece) = self.pick_next() else {
            return Ok(None);
        };
        self.emit(EngineEvent::PieceDownloading(piece));
        self.write_piece(piece).await?;
        self.complete_piece(piece);
        Ok(Some(piece))
    }

    /// Downloads a piece every `interval` until done, paused with nothing
    /// left, or invalidated.
    ///
    /// # Errors
    ///
    /// Returns an error if piece data cannot be written.
    pub async fn run(&self, interval: Duration) -> std::io::Result<()> {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if !self.is_valid() || self.finished_count() == self.layout.piece_count as usize {
                return Ok(());
            }
            self.download_next().await?;
        }
    }

    /// Marks a piece finished without writing data and reports it.
    pub fn complete_piece(&self, piece: PieceIndex) {
        let newly_finished_files = {
            let mut state = self.state.lock();
            let Some(done) = state.finished.get_mut(piece.as_usize()) else {
                return;
            };
            if *done {
                return;
            }
            *done = true;
            state.deadlines.remove(&piece.as_u32());
            self.files_completed_by(&state.finished, piece)
        };
        debug!("Simulated piece {} finished", piece);

        self.emit(EngineEvent::PieceFinished(piece));
        for file in newly_finished_files {
            self.emit(EngineEvent::FileCompleted(file));
        }
        if self.finished_count() == self.layout.piece_count as usize {
            info!("Simulated torrent finished");
            self.emit(EngineEvent::TorrentFinished);
        }
    }

    fn pick_next(&self) -> Option<PieceIndex> {
        let state = self.state.lock();
        if state.paused {
            return None;
        }
        let unfinished = |index: &u32| !state.finished.get(*index as usize).copied().unwrap_or(true);
        state
            .deadlines
            .iter()
            .filter(|(index, _)| unfinished(*index))
            .min_by_key(|(index, deadline)| (**deadline, **index))
            .map(|(index, _)| *index)
            .or_else(|| (0..self.layout.piece_count).find(|index| unfinished(index)))
            .map(PieceIndex::new)
    }

    /// Files whose pieces are all finished and that include `piece`.
    fn files_completed_by(&self, finished: &[bool], piece: PieceIndex) -> Vec<usize> {
        let piece_length = self.layout.piece_length as u64;
        let mut offset = 0u64;
        let mut completed = Vec::new();
        for (index, file) in self.layout.files.iter().enumerate() {
            let start = offset;
            offset += file.size;
            if file.size == 0 || piece_length == 0 {
                continue;
            }
            let first = (start / piece_length) as u32;
            let last = ((offset - 1) / piece_length) as u32;
            if (first..=last).contains(&piece.as_u32())
                && (first..=last).all(|p| finished.get(p as usize).copied().unwrap_or(false))
            {
                completed.push(index);
            }
        }
        completed
    }

    async fn write_piece(&self, piece: PieceIndex) -> std::io::Result<()> {
        let Some(directory) = &self.save_directory else {
            return Ok(());
        };
        let piece_length = self.layout.piece_length as u64;
        let piece_start = piece.as_u32() as u64 * piece_length;
        let piece_end = (piece_start + piece_length).min(self.layout.total_size());

        let mut file_start = 0u64;
        for file in &self.layout.files {
            let file_end = file_start + file.size;
            let start = piece_start.max(file_start);
            let end = piece_end.min(file_end);
            if start < end {
                let path = directory.join(file.relative_path());
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let mut handle = tokio::fs::OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(&path)
                    .await?;
                let data: Vec<u8> = (start..end).map(simulated_byte).collect();
                handle.seek(SeekFrom::Start(start - file_start)).await?;
                handle.write_all(&data).await?;
                handle.flush().await?;
            }
            file_start = file_end;
        }
        Ok(())
    }

    fn record(&self, command: EngineCommand) {
        self.state.lock().commands.push(command);
    }
}

impl TorrentEngine for SimulatedEngine {
    fn set_piece_deadline(&self, piece: PieceIndex, deadline: i32) {
        let mut state = self.state.lock();
        state.deadlines.insert(piece.as_u32(), deadline);
        state
            .commands
            .push(EngineCommand::SetPieceDeadline(piece, deadline));
    }

    fn clear_piece_deadlines(&self) {
        let mut state = self.state.lock();
        state.deadlines.clear();
        state.commands.push(EngineCommand::ClearPieceDeadlines);
    }

    fn set_file_priority(&self, file_index: usize, priority: FilePriority) {
        self.record(EngineCommand::SetFilePriority(file_index, priority));
    }

    fn resume(&self) {
        let mut state = self.state.lock();
        state.paused = false;
        state.commands.push(EngineCommand::Resume);
    }

    fn pause(&self) {
        let mut state = self.state.lock();
        state.paused = true;
        state.commands.push(EngineCommand::Pause);
    }

    fn post_status_updates(&self) {
        self.record(EngineCommand::PostStatusUpdates);
        let piece_count = self.layout.piece_count.max(1) as f32;
        let progress = self.finished_count() as f32 / piece_count;
        self.emit(EngineEvent::StatsUpdate(NativeStats {
            download_payload_rate: self.layout.piece_length as u64,
            upload_payload_rate: 0,
            progress: if self.layout.piece_count == 0 { 1.0 } else { progress },
            total_payload_upload: 0,
        }));
    }

    fn reload_file(&self) -> Result<TorrentLayout, String> {
        self.record(EngineCommand::ReloadFile);
        if self.fail_reload.load(Ordering::Relaxed) {
            return Err("simulated reload failure".to_string());
        }
        Ok(self.layout.clone())
    }

    fn post_save_resume(&self) {
        self.record(EngineCommand::PostSaveResume);
        let bitfield = self
            .state
            .lock()
            .finished
            .iter()
            .map(|done| u8::from(*done))
            .collect();
        self.emit(EngineEvent::SaveResumeData(bitfield));
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }
}
