//! Tracked, detached pipeline runs.
//!
//! Used by the dispatch fallback and the stuck-job monitor. A run that errors
//! or panics is logged and its itinerary is marked `failed` unless another run
//! holds the claim; nothing escapes the task.

use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info_span, warn};

use super::processor::{ProcessingPipeline, RunOutcome};

/// Why a detached run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOrigin {
    /// The job queue rejected the enqueue.
    DirectFallback,
    /// The stuck-job monitor found the itinerary stranded in `pending`.
    StuckRecovery,
}

impl RunOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectFallback => "direct_fallback",
            Self::StuckRecovery => "stuck_recovery",
        }
    }
}

impl std::fmt::Display for RunOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Spawner for detached pipeline runs. Clones share the same tracker.
#[derive(Debug, Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `pipeline` for `itinerary_id` in the background.
    pub fn spawn_run(
        &self,
        pipeline: Arc<ProcessingPipeline>,
        itinerary_id: i64,
        origin: RunOrigin,
    ) {
        let span = info_span!("detached_run", itinerary_id, origin = origin.as_str());
        self.tracker.spawn(
            async move {
                match pipeline.run_guarded(itinerary_id).await {
                    Ok(RunOutcome::Completed) => debug!("Detached run completed"),
                    Ok(RunOutcome::ClaimLost) => debug!("Detached run lost the claim"),
                    Ok(RunOutcome::Failed { reason }) => {
                        warn!(%reason, "Detached run failed");
                    }
                    Err(e) => {
                        // Errors only come from before the claim, so the row
                        // may belong to another run; fail it only if unclaimed.
                        error!("Detached run errored: {}", e);
                        pipeline.fail_if_pending(itinerary_id).await;
                    }
                }
            }
            .instrument(span),
        );
    }

    /// Number of detached runs still in flight.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every detached run, including ones spawned while waiting,
    /// has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
