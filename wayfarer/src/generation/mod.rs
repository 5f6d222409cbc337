//! Itinerary content generation.
//!
//! The pipeline only sees [`ContentGenerator`]; the production implementation
//! talks to an OpenAI-compatible chat completions endpoint.

mod openai;
mod prompt;

pub use openai::{GeneratorConfig, OpenAiGenerator};
pub use prompt::GenerationRequest;

use async_trait::async_trait;

use crate::Result;

/// Text produced for an itinerary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedContent {
    pub content: String,
}

/// Produces itinerary text from a prompt. Implementations do not retry.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, model: &str) -> Result<GeneratedContent>;
}
