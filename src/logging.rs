//! Tracing setup for the bridge.
//!
//! The app extension has no console of its own, so file logging can be
//! switched on from the config. The C ABI may create several bridges in one
//! process; only the first initialisation installs a subscriber.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{self, LoggingConfig};

const MAX_LOG_SIZE: u64 = 1024 * 1024; // 1MB

/// Initialize logging.
///
/// Returns a guard that must be kept alive while file logging is wanted.
/// `RUST_LOG` overrides the configured level.
pub fn init_logging(logging: &LoggingConfig) -> io::Result<Option<WorkerGuard>> {
    let env_filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    if logging.file {
        let log_dir = log_directory();
        fs::create_dir_all(&log_dir)?;

        let log_path = log_dir.join("bridge.log");
        truncate_if_needed(&log_path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let (non_blocking_file, guard) = tracing_appender::non_blocking(BufWriter::new(file));

        let installed = tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt::layer().with_writer(io::stderr))
            .with(
                fmt::layer()
                    .with_writer(non_blocking_file)
                    .with_ansi(false)
                    .with_target(true),
            )
            .try_init()
            .is_ok();

        if installed {
            tracing::info!("Logging to file: {}", log_path.display());
            Ok(Some(guard))
        } else {
            Ok(None)
        }
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_writer(io::stderr)
            .try_init();

        Ok(None)
    }
}

/// Directory log files are written to.
pub fn log_directory() -> PathBuf {
    config::data_dir().join("logs")
}

/// Truncate log file if it exceeds MAX_LOG_SIZE.
fn truncate_if_needed(log_path: &Path) -> io::Result<()> {
    if log_path.exists() {
        let metadata = fs::metadata(log_path)?;
        if metadata.len() > MAX_LOG_SIZE {
            let file = File::create(log_path)?;
            file.set_len(0)?;
        }
    }
    Ok(())
}
