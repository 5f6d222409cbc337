//! Concurrent callers contending for the same rows.

mod common;

use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use common::*;
use wayfarer::database::models::{Itinerary, NewItinerary, ProcessingStatus};
use wayfarer::database::repositories::{
    ItineraryRepository, JobRepository, SqlxItineraryRepository,
};
use wayfarer::pipeline::{
    BackgroundTasks, EnqueueOptions, ItineraryJob, JobQueue, JobQueueConfig, PipelineConfig,
    ProcessingPipeline, RunOrigin, RunOutcome,
};
use wayfarer::{Error, Result};

#[derive(Debug, Clone, Copy)]
enum ReadFault {
    Error,
    Panic,
}

/// The real store, except that loading an itinerary breaks.
struct BrokenReads {
    inner: Arc<SqlxItineraryRepository>,
    fault: ReadFault,
}

#[async_trait]
impl ItineraryRepository for BrokenReads {
    async fn create(&self, new: NewItinerary) -> Result<Itinerary> {
        self.inner.create(new).await
    }
    async fn find_by_id(&self, _id: i64) -> Result<Option<Itinerary>> {
        match self.fault {
            ReadFault::Error => Err(Error::Database("disk I/O error".to_string())),
            ReadFault::Panic => panic!("itinerary read exploded"),
        }
    }
    async fn claim_for_processing(&self, id: i64) -> Result<bool> {
        self.inner.claim_for_processing(id).await
    }
    async fn update_content(
        &self,
        id: i64,
        content: &str,
        model: &str,
        pdf_filename: Option<&str>,
        pdf_path: Option<&str>,
    ) -> Result<bool> {
        self.inner
            .update_content(id, content, model, pdf_filename, pdf_path)
            .await
    }
    async fn update_status(
        &self,
        id: i64,
        status: ProcessingStatus,
        completed_at: Option<i64>,
    ) -> Result<bool> {
        self.inner.update_status(id, status, completed_at).await
    }
    async fn fail_if_pending(&self, id: i64) -> Result<bool> {
        self.inner.fail_if_pending(id).await
    }
    async fn find_pending(&self, limit: u32) -> Result<Vec<Itinerary>> {
        self.inner.find_pending(limit).await
    }
}

fn broken_pipeline(
    db: &TestDb,
    fault: ReadFault,
    generator: Arc<FakeGenerator>,
) -> Arc<ProcessingPipeline> {
    Arc::new(ProcessingPipeline::new(
        PipelineConfig::default(),
        Arc::new(BrokenReads {
            inner: db.store.clone(),
            fault,
        }),
        generator,
        FakeRenderer::new(),
    ))
}

/// A second run that breaks before claiming must not touch the owner's row.
async fn owner_survives_broken_second_run(fault: ReadFault) {
    let db = test_db().await;
    let owner_generator = FakeGenerator::with_delay(Behavior::Succeed, Duration::from_millis(500));
    let owner = Arc::new(ProcessingPipeline::new(
        PipelineConfig::default(),
        db.store.clone(),
        owner_generator.clone(),
        FakeRenderer::new(),
    ));
    let broken_generator = FakeGenerator::new(Behavior::Succeed);
    let broken = broken_pipeline(&db, fault, broken_generator.clone());

    let id = db.store.create(trip("Tbilisi, Georgia")).await.unwrap().id;
    let owner_run = tokio::spawn({
        let owner = owner.clone();
        async move { owner.run_guarded(id).await }
    });

    let store = db.store.clone();
    wait_until("owner to claim the itinerary", || {
        let store = store.clone();
        async move {
            let it = store.find_by_id(id).await.unwrap().unwrap();
            it.status() == Some(ProcessingStatus::Processing)
        }
    })
    .await;

    let tasks = BackgroundTasks::new();
    tasks.spawn_run(broken, id, RunOrigin::DirectFallback);
    tasks.wait_idle().await;

    let it = db.store.find_by_id(id).await.unwrap().unwrap();
    assert_status(&it, ProcessingStatus::Processing);

    assert_eq!(owner_run.await.unwrap().unwrap(), RunOutcome::Completed);
    let it = db.store.find_by_id(id).await.unwrap().unwrap();
    assert_status(&it, ProcessingStatus::Completed);
    assert!(it.has_outputs());
    assert_eq!(owner_generator.calls(), 1);
    assert_eq!(broken_generator.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn erroring_run_without_claim_leaves_owner_alone() {
    owner_survives_broken_second_run(ReadFault::Error).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_run_without_claim_leaves_owner_alone() {
    owner_survives_broken_second_run(ReadFault::Panic).await;
}

#[tokio::test]
async fn broken_detached_run_fails_unclaimed_itinerary() {
    for fault in [ReadFault::Error, ReadFault::Panic] {
        let db = test_db().await;
        let generator = FakeGenerator::new(Behavior::Succeed);
        let broken = broken_pipeline(&db, fault, generator.clone());
        let id = db.store.create(trip("Valletta, Malta")).await.unwrap().id;

        let tasks = BackgroundTasks::new();
        tasks.spawn_run(broken, id, RunOrigin::DirectFallback);
        tasks.wait_idle().await;

        let it = db.store.find_by_id(id).await.unwrap().unwrap();
        assert_status(&it, ProcessingStatus::Failed);
        assert!(!it.has_outputs());
        assert_eq!(generator.calls(), 0, "{fault:?}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_runs_admit_exactly_one() {
    const RUNNERS: usize = 12;

    let db = test_db().await;
    let generator = FakeGenerator::with_delay(Behavior::Succeed, Duration::from_millis(50));
    let renderer = FakeRenderer::new();
    let pipeline = Arc::new(ProcessingPipeline::new(
        PipelineConfig::default(),
        db.store.clone(),
        generator.clone(),
        renderer.clone(),
    ));

    let d = db.store.create(trip("Kyoto, Japan")).await.unwrap();

    let id = d.id;
    let mut runs = JoinSet::new();
    for _ in 0..RUNNERS {
        let pipeline = pipeline.clone();
        runs.spawn(async move { pipeline.run(id).await.unwrap() });
    }

    let mut completed = 0;
    let mut lost = 0;
    while let Some(outcome) = runs.join_next().await {
        match outcome.unwrap() {
            RunOutcome::Completed => completed += 1,
            RunOutcome::ClaimLost => lost += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(completed, 1);
    assert_eq!(lost, RUNNERS - 1);
    assert_eq!(generator.calls(), 1);
    assert_eq!(renderer.calls(), 1);

    let d = db.store.find_by_id(d.id).await.unwrap().unwrap();
    assert_status(&d, ProcessingStatus::Completed);
    assert!(d.has_outputs());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn terminal_itinerary_is_never_reprocessed() {
    let db = test_db().await;
    let generator = FakeGenerator::new(Behavior::Succeed);
    let pipeline = ProcessingPipeline::new(
        PipelineConfig::default(),
        db.store.clone(),
        generator.clone(),
        FakeRenderer::new(),
    );

    let it = db.store.create(trip("Muscat, Oman")).await.unwrap();
    assert_eq!(pipeline.run(it.id).await.unwrap(), RunOutcome::Completed);
    let first = db.store.find_by_id(it.id).await.unwrap().unwrap();

    for _ in 0..3 {
        assert_eq!(pipeline.run(it.id).await.unwrap(), RunOutcome::ClaimLost);
    }
    assert!(!pipeline.fail_if_pending(it.id).await);

    let after = db.store.find_by_id(it.id).await.unwrap().unwrap();
    assert_eq!(after.generated_content, first.generated_content);
    assert_eq!(after.completed_at, first.completed_at);
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn unknown_itinerary_is_not_found() {
    let db = test_db().await;
    let generator = FakeGenerator::new(Behavior::Succeed);
    let pipeline = ProcessingPipeline::new(
        PipelineConfig::default(),
        db.store.clone(),
        generator.clone(),
        FakeRenderer::new(),
    );

    let err = pipeline.run(12_345).await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn render_failure_marks_failed_without_outputs() {
    let db = test_db().await;
    let pipeline = ProcessingPipeline::new(
        PipelineConfig::default(),
        db.store.clone(),
        FakeGenerator::new(Behavior::Succeed),
        FakeRenderer::failing(),
    );

    let it = db.store.create(trip("Accra, Ghana")).await.unwrap();
    let outcome = pipeline.run(it.id).await.unwrap();
    let RunOutcome::Failed { reason } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(reason.contains("PDF rendering failed"));

    let it = db.store.find_by_id(it.id).await.unwrap().unwrap();
    assert_status(&it, ProcessingStatus::Failed);
    assert_eq!(it.generated_content, "");
    assert!(it.model_used.is_none());
}

#[tokio::test]
async fn slow_generation_times_out_into_failure() {
    let db = test_db().await;
    let pipeline = ProcessingPipeline::new(
        PipelineConfig::default().with_timeouts(Duration::from_secs(1), Duration::from_secs(1)),
        db.store.clone(),
        FakeGenerator::with_delay(Behavior::Succeed, Duration::from_secs(30)),
        FakeRenderer::new(),
    );

    let it = db.store.create(trip("Ushuaia, Argentina")).await.unwrap();
    let outcome = pipeline.run(it.id).await.unwrap();
    assert!(
        matches!(&outcome, RunOutcome::Failed { reason } if reason.contains("timed out")),
        "{outcome:?}"
    );

    let it = db.store.find_by_id(it.id).await.unwrap().unwrap();
    assert_status(&it, ProcessingStatus::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_dequeue_never_hands_out_a_job_twice() {
    const JOBS: i64 = 60;
    const CONSUMERS: usize = 8;

    let db = test_db().await;
    let queue = Arc::new(JobQueue::new(JobQueueConfig::default(), db.jobs.clone()));
    for i in 0..JOBS {
        queue
            .enqueue(
                ItineraryJob { itinerary_id: i },
                EnqueueOptions::default().with_priority(i % 3),
            )
            .await
            .unwrap();
    }

    let seen = Arc::new(DashSet::new());
    let mut consumers = JoinSet::new();
    for c in 0..CONSUMERS {
        let queue = queue.clone();
        let seen = seen.clone();
        consumers.spawn(async move {
            let worker = format!("consumer-{c}");
            while let Some(job) = queue.dequeue(&worker).await.unwrap() {
                assert!(seen.insert(job.id.clone()), "job {} claimed twice", job.id);
                queue.complete(&job).await.unwrap();
            }
        });
    }
    while let Some(res) = consumers.join_next().await {
        res.unwrap();
    }

    assert_eq!(seen.len(), JOBS as usize);
    let depth = db.jobs.depth("itinerary-processing").await.unwrap();
    assert_eq!(depth.waiting + depth.active + depth.delayed, 0);
}
