//! Periodic recovery of itineraries stranded in `pending`.
//!
//! Independent of the broker's own stall handling: this looks at the
//! itinerary table, not at jobs, and re-runs anything that has waited longer
//! than the threshold. Duplicate runs are harmless because of the claim.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::job_queue::JobQueue;
use super::processor::ProcessingPipeline;
use super::tasks::{BackgroundTasks, RunOrigin};
use crate::Result;
use crate::database::repositories::ItineraryRepository;
use crate::database::time::{duration_ms, now_ms};

/// Number of recent dispatches remembered for inspection.
const RECENT_DISPATCH_CAPACITY: usize = 256;

/// Stuck-job monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckMonitorConfig {
    /// Seconds between checks.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// A pending itinerary older than this many seconds is considered stuck.
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,

    /// Oldest pending itineraries inspected per check.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_stuck_threshold_secs() -> u64 {
    300
}

fn default_batch_size() -> u32 {
    10
}

impl Default for StuckMonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
            batch_size: default_batch_size(),
        }
    }
}

impl StuckMonitorConfig {
    pub fn with_interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }
}

struct MonitorCore {
    config: StuckMonitorConfig,
    queue: Arc<JobQueue>,
    store: Arc<dyn ItineraryRepository>,
    pipeline: Arc<ProcessingPipeline>,
    tasks: BackgroundTasks,
    recent: Mutex<VecDeque<i64>>,
}

impl MonitorCore {
    async fn tick(&self) -> Result<Vec<i64>> {
        let depth = self.queue.depth().await?;
        if depth.waiting == 0 {
            debug!("No waiting jobs, skipping stuck itinerary check");
            return Ok(Vec::new());
        }

        let pending = self.store.find_pending(self.config.batch_size).await?;
        let threshold_ms = duration_ms(self.config.stuck_threshold());
        let now = now_ms();

        let mut dispatched = Vec::new();
        for itinerary in pending {
            let age_ms = now.saturating_sub(itinerary.created_at);
            if age_ms < threshold_ms {
                continue;
            }

            warn!(
                itinerary_id = itinerary.id,
                age_secs = age_ms / 1000,
                "Re-dispatching stuck itinerary"
            );
            self.tasks
                .spawn_run(self.pipeline.clone(), itinerary.id, RunOrigin::StuckRecovery);
            dispatched.push(itinerary.id);
        }

        if !dispatched.is_empty() {
            let mut recent = self.recent.lock();
            for id in &dispatched {
                if recent.len() == RECENT_DISPATCH_CAPACITY {
                    recent.pop_front();
                }
                recent.push_back(*id);
            }
            info!(
                count = dispatched.len(),
                waiting = depth.waiting,
                "Stuck itinerary check dispatched recovery runs"
            );
        }

        Ok(dispatched)
    }
}

/// Periodic stuck-itinerary check with an explicit `start`/`stop` lifecycle.
pub struct StuckJobMonitor {
    core: Arc<MonitorCore>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl StuckJobMonitor {
    pub fn new(
        config: StuckMonitorConfig,
        queue: Arc<JobQueue>,
        store: Arc<dyn ItineraryRepository>,
        pipeline: Arc<ProcessingPipeline>,
        tasks: BackgroundTasks,
    ) -> Self {
        Self {
            core: Arc::new(MonitorCore {
                config,
                queue,
                store,
                pipeline,
                tasks,
                recent: Mutex::new(VecDeque::new()),
            }),
            running: Mutex::new(None),
        }
    }

    /// Begin checking every `interval_secs`. The first check happens one
    /// interval after start. Calling this while running logs a warning and
    /// does nothing.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            warn!("Stuck job monitor already running");
            return;
        }

        let token = CancellationToken::new();
        let core = self.core.clone();
        let cancel = token.clone();
        let period = core.config.interval();

        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = core.tick().await {
                            warn!("Stuck job check failed: {}", e);
                        }
                    }
                }
            }
            debug!("Stuck job monitor loop exited");
        });

        info!(
            interval_secs = self.core.config.interval_secs,
            threshold_secs = self.core.config.stuck_threshold_secs,
            "Stuck job monitor started"
        );
        *running = Some((token, handle));
    }

    /// Stop the periodic check. Runs it already dispatched keep going.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Stuck job monitor task ended abnormally: {}", e);
            }
            info!("Stuck job monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Run one check now. Returns the itinerary ids dispatched for recovery;
    /// their runs are not awaited.
    pub async fn tick(&self) -> Result<Vec<i64>> {
        self.core.tick().await
    }

    /// Most recently dispatched itinerary ids, oldest first.
    pub fn recent_dispatches(&self) -> Vec<i64> {
        self.core.recent.lock().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_never_zero() {
        let config = StuckMonitorConfig::default().with_interval_secs(0);
        assert_eq!(config.interval(), Duration::from_secs(1));
    }

    #[test]
    fn defaults() {
        let config = StuckMonitorConfig::default();
        assert_eq!(config.stuck_threshold(), Duration::from_secs(300));
        assert_eq!(config.batch_size, 10);
    }
}
