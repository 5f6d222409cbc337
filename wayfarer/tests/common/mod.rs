#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

use wayfarer::config::AppConfig;
use wayfarer::database::models::{
    Itinerary, JobRecord, NewItinerary, ProcessingStatus, QueueDepth,
};
use wayfarer::database::repositories::{
    ItineraryRepository, JobRepository, SqlxItineraryRepository, SqlxJobRepository, StallSweep,
};
use wayfarer::database::{DbPool, init_pool, run_migrations};
use wayfarer::generation::{ContentGenerator, GeneratedContent};
use wayfarer::render::{PdfRenderer, RenderedPdf};
use wayfarer::{Error, Result};

pub struct TestDb {
    pub dir: TempDir,
    pub pool: DbPool,
    pub store: Arc<SqlxItineraryRepository>,
    pub jobs: Arc<SqlxJobRepository>,
}

pub async fn test_db() -> TestDb {
    let dir = TempDir::new().unwrap();
    let url = format!(
        "sqlite:{}",
        dir.path().join("wayfarer.db").to_string_lossy().replace('\\', "/")
    );
    let pool = init_pool(&url, 8).await.unwrap();
    run_migrations(&pool).await.unwrap();
    TestDb {
        store: Arc::new(SqlxItineraryRepository::new(pool.clone())),
        jobs: Arc::new(SqlxJobRepository::new(pool.clone())),
        pool,
        dir,
    }
}

/// Fast timings suitable for tests. The monitor and purge loops are effectively
/// parked; tests drive them by hand.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.job_queue.connect_timeout_ms = 300;
    config.job_queue.backoff_ms = 20;
    config.worker_pool.max_workers = 3;
    config.worker_pool.poll_interval_ms = 20;
    config.pipeline.generation_timeout_secs = 5;
    config.pipeline.render_timeout_secs = 5;
    config.stuck_monitor.interval_secs = 3600;
    config.stuck_monitor.stuck_threshold_secs = 60;
    config.purge.check_interval_secs = 3600;
    config
}

pub fn trip(destination: &str) -> NewItinerary {
    NewItinerary::new(
        "client-42",
        destination,
        NaiveDate::from_ymd_opt(2031, 6, 1).unwrap(),
        NaiveDate::from_ymd_opt(2031, 6, 5).unwrap(),
    )
    .with_budget("moderate")
    .with_interests(["food", "history"])
}

/// Move an itinerary's creation time `age` into the past.
pub async fn backdate(pool: &DbPool, id: i64, age: Duration) {
    let created_at = chrono::Utc::now().timestamp_millis() - age.as_millis() as i64;
    sqlx::query("UPDATE itinerary SET created_at = ? WHERE id = ?")
        .bind(created_at)
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

/// Poll until the itinerary reaches a terminal state.
pub async fn wait_terminal(store: &dyn ItineraryRepository, id: i64) -> Itinerary {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let it = store.find_by_id(id).await.unwrap().unwrap();
        if it.status().is_some_and(|s| s.is_terminal()) {
            return it;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "itinerary {id} stuck at {}",
            it.processing_status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn assert_status(it: &Itinerary, status: ProcessingStatus) {
    assert_eq!(it.status(), Some(status), "itinerary {} status", it.id);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    Fail,
    Panic,
}

/// Content generator that counts calls.
pub struct FakeGenerator {
    calls: AtomicUsize,
    delay: Duration,
    behavior: Behavior,
}

impl FakeGenerator {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Self::with_delay(behavior, Duration::ZERO)
    }

    pub fn with_delay(behavior: Behavior, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            behavior,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentGenerator for FakeGenerator {
    async fn generate(&self, prompt: &str, _model: &str) -> Result<GeneratedContent> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.behavior {
            Behavior::Succeed => Ok(GeneratedContent {
                content: format!("## Day 1\n{}", prompt.lines().next().unwrap_or_default()),
            }),
            Behavior::Fail => Err(Error::generation("provider returned 503")),
            Behavior::Panic => panic!("generator exploded"),
        }
    }
}

/// PDF renderer that counts calls and never touches the filesystem.
pub struct FakeRenderer {
    calls: AtomicUsize,
    fail: bool,
}

impl FakeRenderer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PdfRenderer for FakeRenderer {
    async fn render(&self, itinerary: &Itinerary, _content: &str) -> Result<RenderedPdf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::render("converter exited with status 1"));
        }
        let filename = format!("itinerary-{}.pdf", itinerary.id);
        Ok(RenderedPdf {
            path: format!("/var/lib/wayfarer/pdfs/{filename}"),
            filename,
        })
    }
}

/// How an [`OfflineBroker`] misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outage {
    /// Every call fails immediately.
    Refused,
    /// Every call hangs.
    Hang,
}

/// A job broker that cannot be reached.
pub struct OfflineBroker {
    outage: Outage,
}

impl OfflineBroker {
    pub fn new(outage: Outage) -> Arc<Self> {
        Arc::new(Self { outage })
    }

    async fn unavailable<T>(&self) -> Result<T> {
        if self.outage == Outage::Hang {
            std::future::pending::<()>().await;
        }
        Err(Error::DatabaseSqlx(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ))))
    }
}

#[async_trait]
impl JobRepository for OfflineBroker {
    async fn insert(&self, _job: &JobRecord) -> Result<()> {
        self.unavailable().await
    }
    async fn get(&self, _id: &str) -> Result<Option<JobRecord>> {
        self.unavailable().await
    }
    async fn claim_next(&self, _queue: &str, _worker_id: &str) -> Result<Option<JobRecord>> {
        self.unavailable().await
    }
    async fn mark_completed(&self, _id: &str) -> Result<bool> {
        self.unavailable().await
    }
    async fn schedule_retry(&self, _id: &str, _error: &str, _run_at: i64) -> Result<bool> {
        self.unavailable().await
    }
    async fn mark_failed(&self, _id: &str, _error: &str) -> Result<bool> {
        self.unavailable().await
    }
    async fn depth(&self, _queue: &str) -> Result<QueueDepth> {
        self.unavailable().await
    }
    async fn requeue_stalled(&self, _q: &str, _before: i64, _max: i64) -> Result<StallSweep> {
        self.unavailable().await
    }
    async fn trim_finished(&self, _status: &str, _keep: u32, _batch: u32) -> Result<u64> {
        self.unavailable().await
    }
    async fn delete_finished_before(&self, _cutoff: i64, _batch: u32) -> Result<u64> {
        self.unavailable().await
    }
    async fn ping(&self) -> Result<()> {
        self.unavailable().await
    }
}
