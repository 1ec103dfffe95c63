//! CLI command implementations

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, ensure};
use clap::Subcommand;
use tidestream_core::TidestreamError;
use tidestream_core::config::TidestreamConfig;
use tidestream_core::engine::simulated::simulated_byte;
use tidestream_core::engine::{
    EngineEvent, FileLayout, FilePriority, SimulatedEngine, TorrentLayout, spawn_event_pump,
};
use tidestream_core::torrent::TorrentSession;
use tracing::info;

const MIB: u64 = 1024 * 1024;
const SIMULATED_TORRENT_ID: &str = "simulate";

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Stream part of a simulated torrent while it downloads
    Simulate {
        /// Size of the simulated file in bytes
        #[arg(long, default_value_t = 64 * MIB)]
        file_size: u64,
        /// Piece length in bytes
        #[arg(long, default_value_t = MIB as u32)]
        piece_size: u32,
        /// Byte offset to start reading at
        #[arg(long, default_value_t = 0)]
        seek: u64,
        /// Number of bytes to read
        #[arg(long, default_value_t = 256 * 1024)]
        read: u64,
        /// Time the simulated engine takes per piece
        #[arg(long, default_value_t = 5)]
        piece_interval_ms: u64,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Commands {
    /// Id of the torrent session the command drives, used to name its log.
    pub fn torrent_id(&self) -> &'static str {
        match self {
            Commands::Simulate { .. } => SIMULATED_TORRENT_ID,
        }
    }
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Simulate {
            file_size,
            piece_size,
            seek,
            read,
            piece_interval_ms,
            json,
        } => {
            run_simulation(
                file_size,
                piece_size,
                seek,
                read,
                Duration::from_millis(piece_interval_ms),
                json,
            )
            .await
        }
    }
}

/// Downloads a simulated file and reads `read` bytes from `seek`.
///
/// # Errors
/// - Invalid sizes or a seek past the end of the file
/// - Session or reader failures while streaming
pub async fn run_simulation(
    file_size: u64,
    piece_size: u32,
    seek: u64,
    read: u64,
    piece_interval: Duration,
    json: bool,
) -> anyhow::Result<()> {
    ensure!(piece_size > 0, "Piece size must be positive");
    ensure!(file_size > 0, "File size must be positive");

    let workspace = tempfile::tempdir().context("Failed to create download directory")?;
    let layout = TorrentLayout::from_files(
        piece_size,
        vec![FileLayout::new("simulated/movie.mkv", file_size)],
    );
    let engine = Arc::new(SimulatedEngine::new(layout).with_save_directory(workspace.path()));
    let session = Arc::new(TorrentSession::new(
        SIMULATED_TORRENT_ID,
        engine.clone(),
        workspace.path(),
        TidestreamConfig::from_env(),
    ));

    let (events, pump) = spawn_event_pump(session.clone());
    engine.attach(events.clone());
    session.start_housekeeping();
    events.send(EngineEvent::TorrentChecked);

    let files = session.get_files().await?;
    let file = files.first().context("Simulated torrent has no files")?;
    let handle = file.create_handle()?;
    handle.resume(FilePriority::High)?;

    let downloader = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(piece_interval).await })
    };

    let mut reader = handle.open_reader()?;
    reader
        .seek(SeekFrom::Start(seek))
        .map_err(|e| anyhow::anyhow!(TidestreamError::from(e).user_message()))?;
    let mut buffer = vec![0u8; read.min(reader.len() - reader.position()) as usize];

    let started = Instant::now();
    reader.read_exact(&mut buffer).await?;
    let elapsed = started.elapsed();
    info!("Read {} bytes at {} in {:?}", buffer.len(), seek, elapsed);

    let verified = buffer
        .iter()
        .enumerate()
        .all(|(i, byte)| *byte == simulated_byte(seek + i as u64));
    let preview: String = buffer
        .iter()
        .take(16)
        .map(|byte| format!("{byte:02x}"))
        .collect();
    let pieces_finished = engine.finished_count();
    let file_progress = file.progress();
    let stats = session.stats().snapshot();

    engine.invalidate();
    drop(reader);
    handle.close();
    downloader.await.context("Downloader task panicked")??;
    pump.await.context("Event pump panicked")?;

    if json {
        let report = serde_json::json!({
            "seek": seek,
            "bytes_read": buffer.len(),
            "elapsed_ms": elapsed.as_millis() as u64,
            "verified": verified,
            "preview": preview,
            "pieces_finished": pieces_finished,
            "file_progress": file_progress,
            "stats": stats,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Read {} bytes at offset {seek} in {elapsed:?}", buffer.len());
        println!("  First bytes: {preview}");
        println!("  Content verified: {verified}");
        println!(
            "  Pieces finished: {pieces_finished}, file progress: {:.1}%",
            file_progress * 100.0
        );
        println!(
            "  Session: {:.2} MB of {:.2} MB",
            stats.downloaded_bytes as f64 / MIB as f64,
            stats.total_size as f64 / MIB as f64
        );
    }

    Ok(())
}
