use std::fs;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::DlError;
use crate::output;

pub const LOG_FILE_NAME: &str = "cnda-dl.log";

/// Home directory, or the working directory when no home is known.
pub fn default_log_dir() -> PathBuf {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Installs the global subscriber: stderr (muted while quiet mode is held)
/// plus `cnda-dl.log` in `log_dir`. Keep the returned guard alive until exit
/// or buffered file lines are lost.
pub fn init_logging(log_dir: Option<&Path>) -> Result<WorkerGuard, DlError> {
    let log_dir = log_dir.map(Path::to_path_buf).unwrap_or_else(default_log_dir);
    fs::create_dir_all(&log_dir)
        .map_err(|err| DlError::Filesystem(format!("create {}: {err}", log_dir.display())))?;

    let file_appender = tracing_appender::rolling::never(&log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(filter_fn(|_| output::console_enabled())),
        )
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()
        .map_err(|err| DlError::Filesystem(format!("logging already initialised: {err}")))?;

    Ok(guard)
}
