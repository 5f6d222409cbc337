//! Periodic retention sweep for finished job rows.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::job_queue::JobQueue;
use crate::Result;

/// Job retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// Completed job rows kept, newest first.
    #[serde(default = "default_keep_completed")]
    pub keep_completed: u32,

    /// Failed job rows kept, newest first.
    #[serde(default = "default_keep_failed")]
    pub keep_failed: u32,

    /// Finished rows older than this are deleted regardless of the counts.
    /// 0 disables the age rule.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Rows deleted per statement.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Seconds between sweeps.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_keep_completed() -> u32 {
    100
}

fn default_keep_failed() -> u32 {
    50
}

fn default_retention_days() -> u32 {
    7
}

fn default_batch_size() -> u32 {
    100
}

fn default_check_interval_secs() -> u64 {
    3600
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            keep_completed: default_keep_completed(),
            keep_failed: default_keep_failed(),
            retention_days: default_retention_days(),
            batch_size: default_batch_size(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl PurgeConfig {
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    fn retention(&self) -> Option<Duration> {
        (self.retention_days > 0)
            .then(|| Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60))
    }
}

/// Trims finished jobs on a timer.
pub struct JobPurgeService {
    config: PurgeConfig,
    queue: Arc<JobQueue>,
}

impl JobPurgeService {
    pub fn new(config: PurgeConfig, queue: Arc<JobQueue>) -> Self {
        Self { config, queue }
    }

    /// One sweep. Returns the number of job rows deleted.
    pub async fn run_purge(&self) -> Result<u64> {
        let deleted = self
            .queue
            .purge(
                self.config.keep_completed,
                self.config.keep_failed,
                self.config.retention(),
                self.config.batch_size,
            )
            .await?;

        if deleted > 0 {
            info!(
                deleted,
                keep_completed = self.config.keep_completed,
                keep_failed = self.config.keep_failed,
                retention_days = self.config.retention_days,
                "Purged finished jobs"
            );
        } else {
            debug!("No jobs to purge");
        }
        Ok(deleted)
    }

    /// Sweep every `check_interval_secs` until `cancellation_token` fires.
    pub fn start_background_task(
        self: Arc<Self>,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(self.config.check_interval_secs.max(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(
                interval_secs = self.config.check_interval_secs,
                "Job purge service started"
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Job purge service shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_purge().await {
                            error!("Job purge failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_days_disables_age_rule() {
        assert!(PurgeConfig::default().with_retention_days(0).retention().is_none());
        assert_eq!(
            PurgeConfig::default().with_retention_days(1).retention(),
            Some(Duration::from_secs(86_400))
        );
    }

    #[test]
    fn default_counts() {
        let config = PurgeConfig::default();
        assert_eq!(config.keep_completed, 100);
        assert_eq!(config.keep_failed, 50);
    }
}
