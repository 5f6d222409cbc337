//! Asynchronous itinerary processing.
//!
//! - [`DispatchController`] enqueues work, falling back to a detached run when
//!   the queue is unavailable.
//! - [`WorkerPool`] consumes the [`JobQueue`] and drives [`ProcessingPipeline`].
//! - [`StuckJobMonitor`] re-runs itineraries stranded in `pending`.
//! - [`JobPurgeService`] keeps the job table bounded.
//!
//! Every path ends in [`ProcessingPipeline::run`], whose conditional claim
//! lets exactly one concurrent caller process a given itinerary.

pub mod dispatch;
pub mod job_queue;
pub mod processor;
pub mod purge;
pub mod stuck_monitor;
pub mod tasks;
pub mod worker_pool;

pub use dispatch::{DispatchController, DispatchMethod};
pub use job_queue::{
    EnqueueOptions, ItineraryJob, JobQueue, JobQueueConfig, QueueHealth, QueuedJob,
};
pub use processor::{PipelineConfig, ProcessingPipeline, RunOutcome};
pub use purge::{JobPurgeService, PurgeConfig};
pub use stuck_monitor::{StuckJobMonitor, StuckMonitorConfig};
pub use tasks::{BackgroundTasks, RunOrigin};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};
