//! File logging with daily rotation to platform-standard directories.
//!
//! The terminal is reserved for generated output, so nothing is logged to stdout or stderr.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use directories::ProjectDirs;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Log file name prefix; the appender adds a `.YYYY-MM-DD` suffix.
const LOG_PREFIX: &str = "specprompt";

const RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Result of initializing the logging system.
pub struct LoggingContext {
    /// Guard that must be held for the application lifetime to ensure logs are flushed.
    pub _guard: WorkerGuard,
    pub session_id: String,
    pub log_directory: PathBuf,
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct LoggingError {
    pub message: String,
}

impl LoggingError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Generates a 6-character random hex session ID.
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let bytes: [u8; 3] = rng.random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Platform log directory.
///
/// macOS: `~/Library/Logs/specprompt/`, Linux: `~/.local/state/specprompt/`,
/// elsewhere the local data directory.
fn log_dir() -> Option<PathBuf> {
    if cfg!(target_os = "macos") {
        return dirs::home_dir().map(|home| home.join("Library").join("Logs").join(LOG_PREFIX));
    }
    let project_dirs = ProjectDirs::from("dev", "specprompt", "specprompt")?;
    Some(
        project_dirs
            .state_dir()
            .unwrap_or_else(|| project_dirs.data_local_dir())
            .to_path_buf(),
    )
}

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over `level`. The returned guard must be held for the application lifetime.
pub fn init(level: &str) -> Result<LoggingContext, LoggingError> {
    let session_id = generate_session_id();

    let log_dir = log_dir().ok_or_else(|| LoggingError::new("Failed to determine log directory"))?;
    fs::create_dir_all(&log_dir)
        .map_err(|e| LoggingError::new(format!("Failed to create log directory: {}", e)))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| LoggingError::new(format!("Failed to install subscriber: {}", e)))?;

    info!(session_id = %session_id, version = env!("CARGO_PKG_VERSION"), "session_start");

    Ok(LoggingContext {
        _guard: guard,
        session_id,
        log_directory: log_dir,
    })
}

/// Whether a file in the log directory is one of ours and past retention.
fn is_expired_log(file_name: &str, age: Duration) -> bool {
    let ours = file_name
        .strip_prefix(LOG_PREFIX)
        .is_some_and(|rest| rest.starts_with('.') && rest.len() > 1);
    ours && age > RETENTION
}

/// Deletes rotated log files older than seven days.
///
/// Errors are logged at WARN level and never prevent startup. Returns the number deleted.
pub fn cleanup_old_logs(log_dir: &Path) -> usize {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "log_cleanup_read_dir_failed");
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut deleted = 0;

    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                warn!(file = %file_name, error = %e, "log_metadata_failed");
                continue;
            }
        };
        // Files dated in the future are left alone.
        let Ok(age) = now.duration_since(modified) else {
            continue;
        };

        if !is_expired_log(file_name, age) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(file = %file_name, age_days = age.as_secs() / 86400, "log_file_deleted");
                deleted += 1;
            }
            Err(e) => warn!(file = %file_name, error = %e, "log_file_delete_failed"),
        }
    }

    if deleted > 0 {
        debug!(count = deleted, "log_cleanup_completed");
    }
    deleted
}
