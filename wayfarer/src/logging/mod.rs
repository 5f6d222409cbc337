//! Logging setup.
//!
//! Console output plus a daily-rolling file in the log directory, filtered by
//! `RUST_LOG` or [`DEFAULT_LOG_FILTER`].

use chrono::{Local, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::{Error, Result};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "wayfarer=info,sqlx=warn";

/// Rolling log file prefix; files are named `<prefix>.<YYYY-MM-DD>`.
const LOG_FILE_PREFIX: &str = "wayfarer.log";

/// Days of log files kept by the retention task.
const LOG_RETENTION_DAYS: i64 = 14;

#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Owns the log directory for the retention task.
pub struct LoggingHandle {
    log_dir: PathBuf,
}

impl LoggingHandle {
    /// Delete old log files once a day until `cancel` fires.
    pub fn start_retention_cleanup(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let log_dir = self.log_dir.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(24 * 60 * 60);
            loop {
                if let Err(e) = cleanup_old_logs(&log_dir, LOG_RETENTION_DAYS).await {
                    warn!(error = %e, "Failed to clean up old logs");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }
            debug!("Log retention task stopped");
        })
    }
}

/// Remove `wayfarer.log.<date>` files dated before `retention_days` ago.
/// Returns the number of files removed.
pub async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).date_naive();
    let prefix = format!("{LOG_FILE_PREFIX}.");

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(&prefix))
            .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        else {
            continue;
        };

        if date < cutoff {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete old log file"),
            }
        }
    }

    if deleted > 0 {
        info!(count = deleted, "Cleaned up old log files");
    }
    Ok(deleted)
}

/// Install the global subscriber. Keep the returned guard alive for the life
/// of the process or buffered file output is lost.
///
/// With `json_file` set, the file layer writes one JSON object per event.
pub fn init_logging(log_dir: &Path, json_file: bool) -> Result<(Arc<LoggingHandle>, WorkerGuard)> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console = fmt::layer().with_ansi(true).with_timer(LocalTimer);

    let (file_text, file_json) = if json_file {
        (
            None,
            Some(
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_timer(LocalTimer),
            ),
        )
    } else {
        (
            Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_timer(LocalTimer),
            ),
            None,
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_text)
        .with(file_json)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {e}")))?;

    let handle = Arc::new(LoggingHandle {
        log_dir: log_dir.to_path_buf(),
    });
    Ok((handle, guard))
}
