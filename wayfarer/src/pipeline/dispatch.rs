//! Queue-or-direct dispatch of itinerary processing.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::job_queue::{EnqueueOptions, ItineraryJob, JobQueue};
use super::processor::ProcessingPipeline;
use super::tasks::{BackgroundTasks, RunOrigin};

/// How a submitted itinerary will be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMethod {
    /// A job was enqueued; a worker will pick it up.
    Queue,
    /// The queue was unavailable; processing runs as a detached task.
    Direct,
}

/// Entry point for requesting itinerary processing.
///
/// [`submit`](Self::submit) never fails: when the job queue cannot take the
/// job, the pipeline is run directly in the background instead.
pub struct DispatchController {
    queue: Arc<JobQueue>,
    pipeline: Arc<ProcessingPipeline>,
    tasks: BackgroundTasks,
}

impl DispatchController {
    pub fn new(
        queue: Arc<JobQueue>,
        pipeline: Arc<ProcessingPipeline>,
        tasks: BackgroundTasks,
    ) -> Self {
        Self {
            queue,
            pipeline,
            tasks,
        }
    }

    pub async fn submit(&self, itinerary_id: i64) -> DispatchMethod {
        match self
            .queue
            .enqueue(ItineraryJob { itinerary_id }, EnqueueOptions::default())
            .await
        {
            Ok(job_id) => {
                debug!(itinerary_id, %job_id, "Itinerary queued for processing");
                DispatchMethod::Queue
            }
            Err(e) => {
                warn!(
                    itinerary_id,
                    "Job queue unavailable, processing directly: {}", e
                );
                self.tasks
                    .spawn_run(self.pipeline.clone(), itinerary_id, RunOrigin::DirectFallback);
                DispatchMethod::Direct
            }
        }
    }
}
