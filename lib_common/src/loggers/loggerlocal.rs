//! # Local Logging Setup
//!
//! Installs the process-wide `tracing` subscriber used by every binary of the
//! workspace:
//!
//! - an `EnvFilter` built from `RUST_LOG`, falling back to the configured level;
//! - a human readable console layer with targets and ANSI colors;
//! - a JSON file layer written through a non-blocking, daily rotating appender
//!   that keeps a bounded number of old files.
//!
//! The returned `WorkerGuard` flushes the file writer when dropped, so callers
//! hold it for the lifetime of `main`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Where and how much to log.
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Prefix of the log file names, usually the binary name.
    pub app_name: String,
    /// Directory of the rotating log files; created when missing.
    pub log_dir: PathBuf,
    /// Default filter directive when `RUST_LOG` is not set (e.g. `info`).
    pub level: String,
    /// Number of daily files kept on disk.
    pub max_files: usize,
}

impl LoggingOptions {
    /// Options with the default retention.
    pub fn new(app_name: &str, log_dir: impl Into<PathBuf>, level: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            log_dir: log_dir.into(),
            level: level.to_string(),
            max_files: 7,
        }
    }
}

/// Builds the level filter: `RUST_LOG` wins, otherwise `level`.
pub fn build_filter(level: &str) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid log level '{}'", level)),
    }
}

/// Daily rotating `<app_name>.<date>.log` files under `log_dir`.
pub fn file_appender(app_name: &str, log_dir: &Path, max_files: usize) -> anyhow::Result<RollingFileAppender> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(app_name)
        .filename_suffix("log")
        .max_log_files(max_files.max(1))
        .build(log_dir)
        .context("failed to create rolling log file")
}

/// Installs the global subscriber.
///
/// # Errors
/// Fails when the log directory cannot be created, the level is not a valid
/// filter directive, or a global subscriber is already installed.
pub fn init_logging(options: &LoggingOptions) -> anyhow::Result<WorkerGuard> {
    let filter = build_filter(&options.level)?;
    let appender = file_appender(&options.app_name, &options.log_dir, options.max_files)?;
    let (non_blocking_appender, guard) = tracing_appender::non_blocking(appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    tracing::info!(
        app = %options.app_name,
        level = %options.level,
        log_dir = %options.log_dir.display(),
        "Logging initialized"
    );
    Ok(guard)
}
