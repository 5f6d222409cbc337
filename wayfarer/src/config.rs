//! Application configuration.
//!
//! Each subsystem owns its config struct (with serde defaults and `with_*`
//! setters); [`AppConfig`] gathers them and fills them from `WAYFARER_*`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::generation::GeneratorConfig;
use crate::pipeline::{
    JobQueueConfig, PipelineConfig, PurgeConfig, StuckMonitorConfig, WorkerPoolConfig,
};
use crate::render::RendererConfig;
use crate::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_db_pool_size")]
    pub db_pool_size: u32,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Write the log file as JSON lines.
    #[serde(default)]
    pub log_json: bool,

    #[serde(default)]
    pub job_queue: JobQueueConfig,

    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub stuck_monitor: StuckMonitorConfig,

    #[serde(default)]
    pub purge: PurgeConfig,

    #[serde(default)]
    pub generator: GeneratorConfig,

    #[serde(default)]
    pub renderer: RendererConfig,
}

fn default_database_url() -> String {
    "sqlite:wayfarer.db".to_string()
}

fn default_db_pool_size() -> u32 {
    crate::database::DEFAULT_POOL_SIZE
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            db_pool_size: default_db_pool_size(),
            log_dir: default_log_dir(),
            log_json: false,
            job_queue: JobQueueConfig::default(),
            worker_pool: WorkerPoolConfig::default(),
            pipeline: PipelineConfig::default(),
            stuck_monitor: StuckMonitorConfig::default(),
            purge: PurgeConfig::default(),
            generator: GeneratorConfig::default(),
            renderer: RendererConfig::default(),
        }
    }
}

/// Parse `key`'s value into `target` if present.
fn set<T, F>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        let raw = raw.trim();
        *target = raw
            .parse()
            .map_err(|e| Error::config(format!("{key}={raw:?}: {e}")))?;
    }
    Ok(())
}

impl AppConfig {
    /// Load from the process environment, after reading `.env` if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from defaults overridden by whatever `lookup` returns.
    ///
    /// Keys: `DATABASE_URL`, `WAYFARER_DB_POOL_SIZE`, `WAYFARER_LOG_DIR`,
    /// `WAYFARER_LOG_JSON`, `WAYFARER_QUEUE_NAME`,
    /// `WAYFARER_QUEUE_CONNECT_TIMEOUT_MS`, `WAYFARER_JOB_ATTEMPTS`,
    /// `WAYFARER_JOB_BACKOFF_MS`, `WAYFARER_WORKERS`,
    /// `WAYFARER_POLL_INTERVAL_MS`, `WAYFARER_STALL_TIMEOUT_SECS`,
    /// `WAYFARER_STALL_CHECK_INTERVAL_SECS`, `WAYFARER_MAX_STALLED_COUNT`,
    /// `WAYFARER_MODEL`, `WAYFARER_GENERATION_TIMEOUT_SECS`,
    /// `WAYFARER_RENDER_TIMEOUT_SECS`, `WAYFARER_MONITOR_INTERVAL_SECS`,
    /// `WAYFARER_STUCK_THRESHOLD_SECS`, `WAYFARER_MONITOR_BATCH_SIZE`,
    /// `WAYFARER_KEEP_COMPLETED_JOBS`, `WAYFARER_KEEP_FAILED_JOBS`,
    /// `WAYFARER_JOB_RETENTION_DAYS`, `WAYFARER_PURGE_INTERVAL_SECS`,
    /// `WAYFARER_AI_BASE_URL`, `WAYFARER_AI_API_KEY` (or `OPENAI_API_KEY`),
    /// `WAYFARER_AI_REQUEST_TIMEOUT_SECS`, `WAYFARER_PDF_DIR`,
    /// `WAYFARER_PDF_COMMAND`, `WAYFARER_PDF_COMMAND_TIMEOUT_SECS`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut c = Self::default();
        let l = &lookup;

        set(l, "DATABASE_URL", &mut c.database_url)?;
        set(l, "WAYFARER_DB_POOL_SIZE", &mut c.db_pool_size)?;
        set(l, "WAYFARER_LOG_DIR", &mut c.log_dir)?;
        set(l, "WAYFARER_LOG_JSON", &mut c.log_json)?;

        set(l, "WAYFARER_QUEUE_NAME", &mut c.job_queue.queue_name)?;
        set(l, "WAYFARER_QUEUE_CONNECT_TIMEOUT_MS", &mut c.job_queue.connect_timeout_ms)?;
        set(l, "WAYFARER_JOB_ATTEMPTS", &mut c.job_queue.max_attempts)?;
        set(l, "WAYFARER_JOB_BACKOFF_MS", &mut c.job_queue.backoff_ms)?;

        set(l, "WAYFARER_WORKERS", &mut c.worker_pool.max_workers)?;
        set(l, "WAYFARER_POLL_INTERVAL_MS", &mut c.worker_pool.poll_interval_ms)?;
        set(l, "WAYFARER_STALL_TIMEOUT_SECS", &mut c.worker_pool.stall_timeout_secs)?;
        set(
            l,
            "WAYFARER_STALL_CHECK_INTERVAL_SECS",
            &mut c.worker_pool.stall_check_interval_secs,
        )?;
        set(l, "WAYFARER_MAX_STALLED_COUNT", &mut c.worker_pool.max_stalled_count)?;

        set(l, "WAYFARER_MODEL", &mut c.pipeline.model)?;
        set(
            l,
            "WAYFARER_GENERATION_TIMEOUT_SECS",
            &mut c.pipeline.generation_timeout_secs,
        )?;
        set(l, "WAYFARER_RENDER_TIMEOUT_SECS", &mut c.pipeline.render_timeout_secs)?;

        set(l, "WAYFARER_MONITOR_INTERVAL_SECS", &mut c.stuck_monitor.interval_secs)?;
        set(
            l,
            "WAYFARER_STUCK_THRESHOLD_SECS",
            &mut c.stuck_monitor.stuck_threshold_secs,
        )?;
        set(l, "WAYFARER_MONITOR_BATCH_SIZE", &mut c.stuck_monitor.batch_size)?;

        set(l, "WAYFARER_KEEP_COMPLETED_JOBS", &mut c.purge.keep_completed)?;
        set(l, "WAYFARER_KEEP_FAILED_JOBS", &mut c.purge.keep_failed)?;
        set(l, "WAYFARER_JOB_RETENTION_DAYS", &mut c.purge.retention_days)?;
        set(l, "WAYFARER_PURGE_INTERVAL_SECS", &mut c.purge.check_interval_secs)?;

        set(l, "WAYFARER_AI_BASE_URL", &mut c.generator.base_url)?;
        set(
            l,
            "WAYFARER_AI_REQUEST_TIMEOUT_SECS",
            &mut c.generator.request_timeout_secs,
        )?;
        c.generator.api_key = lookup("WAYFARER_AI_API_KEY")
            .or_else(|| lookup("OPENAI_API_KEY"))
            .filter(|k| !k.trim().is_empty());

        set(l, "WAYFARER_PDF_DIR", &mut c.renderer.output_dir)?;
        set(l, "WAYFARER_PDF_COMMAND", &mut c.renderer.command)?;
        set(
            l,
            "WAYFARER_PDF_COMMAND_TIMEOUT_SECS",
            &mut c.renderer.command_timeout_secs,
        )?;

        c.validate()?;
        Ok(c)
    }

    /// Reject settings that would break the processing guarantees.
    pub fn validate(&self) -> Result<()> {
        if self.worker_pool.max_workers == 0 {
            return Err(Error::config("worker count must be at least 1"));
        }
        if self.job_queue.max_attempts == 0 {
            return Err(Error::config("job attempts must be at least 1"));
        }
        if self.pipeline.generation_timeout_secs == 0 || self.pipeline.render_timeout_secs == 0 {
            return Err(Error::config("pipeline step timeouts must be non-zero"));
        }
        // A job whose run is still legitimately in progress must never be
        // treated as stalled, or two workers would race on it.
        if self.worker_pool.stall_timeout() <= self.pipeline.max_run_time() {
            return Err(Error::config(format!(
                "stall timeout ({}s) must exceed generation + render timeouts ({}s)",
                self.worker_pool.stall_timeout_secs,
                self.pipeline.max_run_time().as_secs()
            )));
        }
        if self.stuck_monitor.batch_size == 0 {
            return Err(Error::config("monitor batch size must be at least 1"));
        }
        Ok(())
    }
}
