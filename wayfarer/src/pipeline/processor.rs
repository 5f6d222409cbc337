//! Single-itinerary processing: claim, generate, render, persist.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::database::models::{Itinerary, ProcessingStatus};
use crate::database::repositories::ItineraryRepository;
use crate::generation::{ContentGenerator, GenerationRequest};
use crate::render::{PdfRenderer, RenderedPdf};
use crate::{Error, Result};

/// Pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Model requested from the content generator.
    #[serde(default = "default_model")]
    pub model: String,

    /// Budget for one generation call, in seconds.
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,

    /// Budget for one render call, in seconds.
    #[serde(default = "default_render_timeout_secs")]
    pub render_timeout_secs: u64,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_generation_timeout_secs() -> u64 {
    120
}

fn default_render_timeout_secs() -> u64 {
    60
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            generation_timeout_secs: default_generation_timeout_secs(),
            render_timeout_secs: default_render_timeout_secs(),
        }
    }
}

impl PipelineConfig {
    pub fn with_timeouts(mut self, generation: Duration, render: Duration) -> Self {
        self.generation_timeout_secs = generation.as_secs();
        self.render_timeout_secs = render.as_secs();
        self
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    /// Longest a single run can spend after its claim.
    pub fn max_run_time(&self) -> Duration {
        self.generation_timeout() + self.render_timeout()
    }
}

/// Result of one [`ProcessingPipeline::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Outputs stored and the itinerary is `completed`.
    Completed,
    /// The itinerary was marked `failed`.
    Failed { reason: String },
    /// Another run owns the itinerary, or it is no longer pending. Nothing was done.
    ClaimLost,
}

/// Processes one itinerary end to end.
///
/// Any number of callers may run the same id concurrently; the conditional
/// claim admits exactly one of them.
pub struct ProcessingPipeline {
    config: PipelineConfig,
    store: Arc<dyn ItineraryRepository>,
    generator: Arc<dyn ContentGenerator>,
    renderer: Arc<dyn PdfRenderer>,
}

impl ProcessingPipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn ItineraryRepository>,
        generator: Arc<dyn ContentGenerator>,
        renderer: Arc<dyn PdfRenderer>,
    ) -> Self {
        Self {
            config,
            store,
            generator,
            renderer,
        }
    }

    /// Process itinerary `id`.
    ///
    /// Returns `Err` only before the claim: the itinerary is missing
    /// (`NotFound`) or could not be loaded or claimed. Failures after the claim
    /// never surface as errors: the itinerary is marked `failed` and
    /// [`RunOutcome::Failed`] is returned.
    pub async fn run(&self, id: i64) -> Result<RunOutcome> {
        self.run_tracked(id, &AtomicBool::new(false)).await
    }

    /// [`run`](Self::run), with a panic turned into an error.
    ///
    /// A run that panics after winning the claim fails its itinerary. One that
    /// panics before the claim only fails it if it is still `pending`, so it
    /// never overwrites a run owned by someone else.
    pub async fn run_guarded(&self, id: i64) -> Result<RunOutcome> {
        let claimed = AtomicBool::new(false);
        let result = AssertUnwindSafe(self.run_tracked(id, &claimed))
            .catch_unwind()
            .await;

        match result {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(&*panic);
                let owner = claimed.load(Ordering::SeqCst);
                error!(itinerary_id = id, owner, "Itinerary run panicked: {}", message);
                if owner {
                    self.fail_claimed(id).await;
                } else {
                    self.fail_if_pending(id).await;
                }
                Err(Error::Other(format!("itinerary run panicked: {message}")))
            }
        }
    }

    /// Best-effort `pending -> failed` for a run that never won the claim.
    /// Itineraries another run is processing, or that are terminal, are left alone.
    pub async fn fail_if_pending(&self, id: i64) -> bool {
        match self.store.fail_if_pending(id).await {
            Ok(changed) => changed,
            Err(e) => {
                error!(itinerary_id = id, "Failed to mark itinerary as failed: {}", e);
                false
            }
        }
    }

    async fn run_tracked(&self, id: i64, claimed: &AtomicBool) -> Result<RunOutcome> {
        let itinerary = self
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found("Itinerary", id))?;

        if !self.store.claim_for_processing(id).await? {
            debug!(
                itinerary_id = id,
                status = %itinerary.processing_status,
                "Claim lost, skipping"
            );
            return Ok(RunOutcome::ClaimLost);
        }
        claimed.store(true, Ordering::SeqCst);

        let started = Instant::now();
        info!(itinerary_id = id, destination = %itinerary.destination, "Processing itinerary");

        match self.produce(&itinerary).await {
            Ok(()) => {
                info!(
                    itinerary_id = id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Itinerary completed"
                );
                Ok(RunOutcome::Completed)
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(
                    itinerary_id = id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Itinerary processing failed: {}",
                    reason
                );
                self.fail_claimed(id).await;
                Ok(RunOutcome::Failed { reason })
            }
        }
    }

    /// `processing -> failed` for the run holding the claim.
    async fn fail_claimed(&self, id: i64) {
        if let Err(e) = self
            .store
            .update_status(id, ProcessingStatus::Failed, None)
            .await
        {
            error!(itinerary_id = id, "Failed to mark itinerary as failed: {}", e);
        }
    }

    async fn produce(&self, itinerary: &Itinerary) -> Result<()> {
        let id = itinerary.id;
        let prompt = GenerationRequest::from_itinerary(itinerary).to_prompt()?;
        let model = self.config.model.as_str();

        let generated = with_timeout(
            "content generation",
            self.config.generation_timeout(),
            self.generator.generate(&prompt, model),
        )
        .await?;
        if generated.content.trim().is_empty() {
            return Err(Error::generation("generator returned empty content"));
        }

        let RenderedPdf { filename, path } = with_timeout(
            "PDF rendering",
            self.config.render_timeout(),
            self.renderer.render(itinerary, &generated.content),
        )
        .await?;
        if filename.is_empty() || path.is_empty() {
            return Err(Error::render("renderer returned an empty file reference"));
        }

        let stored = self
            .store
            .update_content(id, &generated.content, model, Some(&filename), Some(&path))
            .await?;
        if !stored {
            return Err(Error::Database(format!(
                "itinerary {id} left processing before its content was stored"
            )));
        }

        let completed = self
            .store
            .update_status(id, ProcessingStatus::Completed, None)
            .await?;
        if !completed {
            return Err(Error::Database(format!(
                "itinerary {id} left processing before completion"
            )));
        }

        Ok(())
    }
}

async fn with_timeout<T>(
    operation: &'static str,
    budget: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(budget, fut)
        .await
        .map_err(|_| Error::timeout(operation, budget))?
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
