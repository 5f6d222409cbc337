//! Owner of the processing subsystem's background machinery.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::database::repositories::{ItineraryRepository, JobRepository};
use crate::generation::ContentGenerator;
use crate::pipeline::{
    BackgroundTasks, DispatchController, JobPurgeService, JobQueue, ProcessingPipeline,
    StuckJobMonitor, WorkerPool,
};
use crate::render::PdfRenderer;

/// Builds the processing components from their collaborators and runs them.
///
/// `start` brings up the worker pool (with its stall reaper), the stuck-job
/// monitor and the retention sweep; `stop` shuts them down in reverse and waits
/// for detached runs.
pub struct ProcessingService {
    queue: Arc<JobQueue>,
    pipeline: Arc<ProcessingPipeline>,
    tasks: BackgroundTasks,
    dispatcher: Arc<DispatchController>,
    worker_pool: WorkerPool,
    monitor: StuckJobMonitor,
    purge: Arc<JobPurgeService>,
    purge_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ProcessingService {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn ItineraryRepository>,
        job_repository: Arc<dyn JobRepository>,
        generator: Arc<dyn ContentGenerator>,
        renderer: Arc<dyn PdfRenderer>,
    ) -> Self {
        let queue = Arc::new(JobQueue::new(config.job_queue.clone(), job_repository));
        let pipeline = Arc::new(ProcessingPipeline::new(
            config.pipeline.clone(),
            store.clone(),
            generator,
            renderer,
        ));
        let tasks = BackgroundTasks::new();

        let dispatcher = Arc::new(DispatchController::new(
            queue.clone(),
            pipeline.clone(),
            tasks.clone(),
        ));
        let monitor = StuckJobMonitor::new(
            config.stuck_monitor.clone(),
            queue.clone(),
            store,
            pipeline.clone(),
            tasks.clone(),
        );
        let purge = Arc::new(JobPurgeService::new(config.purge.clone(), queue.clone()));

        Self {
            worker_pool: WorkerPool::new(config.worker_pool.clone()),
            queue,
            pipeline,
            tasks,
            dispatcher,
            monitor,
            purge,
            purge_task: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        info!("Starting itinerary processing service");
        self.worker_pool
            .start(self.queue.clone(), self.pipeline.clone());
        self.monitor.start();

        let mut purge_task = self.purge_task.lock();
        if purge_task.is_none() {
            let token = CancellationToken::new();
            let handle = self.purge.clone().start_background_task(token.clone());
            *purge_task = Some((token, handle));
        }
    }

    pub async fn stop(&self) {
        info!("Stopping itinerary processing service");

        let purge_task = self.purge_task.lock().take();
        if let Some((token, handle)) = purge_task {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Job purge task ended abnormally: {}", e);
            }
        }

        self.monitor.stop().await;
        self.worker_pool.stop().await;

        let in_flight = self.tasks.in_flight();
        if in_flight > 0 {
            info!(in_flight, "Waiting for detached itinerary runs");
        }
        self.tasks.wait_idle().await;
        info!("Itinerary processing service stopped");
    }

    pub fn dispatcher(&self) -> Arc<DispatchController> {
        self.dispatcher.clone()
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn pipeline(&self) -> &Arc<ProcessingPipeline> {
        &self.pipeline
    }

    pub fn monitor(&self) -> &StuckJobMonitor {
        &self.monitor
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.worker_pool
    }
}
