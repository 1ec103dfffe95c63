//! Log output for streaming runs.
//!
//! The console shows what the user asked for. The log file keeps the
//! scheduler's full trace for one run, which is where deadline resets and
//! window slides (tagged with `[<torrent id>]`) end up when playback stalls.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::{Result, TidestreamError};

/// Overrides the log file filter, like `RUST_LOG` does for the console.
pub const FILE_FILTER_ENV: &str = "TIDESTREAM_TRACE";

/// Scheduler internals at full detail, everything else only when it warns.
pub const DEFAULT_FILE_FILTER: &str = "warn,tidestream_core=trace,tidestream=debug";

/// Where and how much to log.
#[derive(Debug, Clone)]
pub struct TracingOptions {
    pub console_level: Level,
    pub logs_dir: PathBuf,
    /// Names the log file, usually the torrent id of the run
    pub run_label: String,
    pub file_filter: String,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            console_level: Level::WARN,
            logs_dir: default_logs_dir().to_path_buf(),
            run_label: "last-run".to_string(),
            file_filter: DEFAULT_FILE_FILTER.to_string(),
        }
    }
}

impl TracingOptions {
    pub fn new(console_level: Level, run_label: impl Into<String>) -> Self {
        Self {
            console_level,
            run_label: run_label.into(),
            ..Self::default()
        }
    }

    pub fn with_logs_dir(mut self, logs_dir: impl Into<PathBuf>) -> Self {
        self.logs_dir = logs_dir.into();
        self
    }

    /// `<logs_dir>/tidestream-<label>.log`, rewritten on every run.
    pub fn log_file_path(&self) -> PathBuf {
        self.logs_dir.join(log_file_name(&self.run_label))
    }
}

/// File name for a run label, keeping only characters safe in paths.
pub fn log_file_name(run_label: &str) -> String {
    let label: String = run_label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let label = if label.is_empty() { "last-run" } else { label.as_str() };
    format!("tidestream-{label}.log")
}

/// Builds the log file filter, preferring [`FILE_FILTER_ENV`] when set.
///
/// # Errors
///
/// - `TidestreamError::Configuration` - If the directives do not parse
pub fn file_filter(directives: &str) -> Result<EnvFilter> {
    let directives = std::env::var(FILE_FILTER_ENV).unwrap_or_else(|_| directives.to_string());
    EnvFilter::try_new(&directives).map_err(|e| TidestreamError::Configuration {
        reason: format!("invalid log filter '{directives}': {e}"),
    })
}

/// Installs the console and file layers as the global subscriber.
///
/// `RUST_LOG` overrides the console level.
///
/// # Errors
///
/// - `TidestreamError::Io` - If the logs directory or log file cannot be created
/// - `TidestreamError::Configuration` - If the file filter is invalid or a
///   subscriber is already installed
pub fn init_tracing(options: &TracingOptions) -> Result<PathBuf> {
    let file_filter = file_filter(&options.file_filter)?;
    create_dir_all(&options.logs_dir)?;
    let log_file_path = options.log_file_path();
    let log_file = File::create(&log_file_path)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.console_level.to_string()));

    let console_layer = fmt::layer()
        .with_target(false)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(file_filter);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| TidestreamError::Configuration {
            reason: format!("tracing already initialized: {e}"),
        })?;

    tracing::info!(
        "Logging run '{}' to {}",
        options.run_label,
        log_file_path.display()
    );
    Ok(log_file_path)
}

/// Console verbosity accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    /// Includes deadline and window changes
    Debug,
    Trace,
}

impl CliLogLevel {
    /// # Examples
    /// ```
    /// use tidestream_core::tracing_setup::CliLogLevel;
    ///
    /// assert_eq!(CliLogLevel::Debug.as_tracing_level(), tracing::Level::DEBUG);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

/// Default logs directory next to the working directory.
pub fn default_logs_dir() -> &'static Path {
    Path::new("logs")
}

#[cfg(test)]
mod tests {
    use clap::ValueEnum;

    use super::*;

    #[test]
    fn test_log_file_named_after_run_label() {
        assert_eq!(log_file_name("abc123"), "tidestream-abc123.log");
        assert_eq!(log_file_name("show/ep 1"), "tidestream-show_ep_1.log");
        assert_eq!(log_file_name(""), "tidestream-last-run.log");

        let options = TracingOptions::new(Level::INFO, "demo").with_logs_dir("/tmp/tide");
        assert_eq!(
            options.log_file_path(),
            PathBuf::from("/tmp/tide/tidestream-demo.log")
        );
    }

    #[test]
    fn test_default_file_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILE_FILTER).is_ok());
        assert_eq!(TracingOptions::default().logs_dir, default_logs_dir());
    }

    #[test]
    fn test_cli_level_parsing_ignores_case() {
        assert_eq!(CliLogLevel::from_str("WARN", true), Ok(CliLogLevel::Warn));
        assert!(CliLogLevel::from_str("loud", true).is_err());
        assert_eq!(CliLogLevel::Trace.as_tracing_level(), Level::TRACE);
    }
}
