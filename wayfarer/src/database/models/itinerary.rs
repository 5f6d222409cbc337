//! Itinerary database models.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Persisted itinerary row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Itinerary {
    pub id: i64,
    pub client_id: String,
    pub session_id: Option<String>,
    pub destination: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub budget: Option<String>,
    /// JSON array of interest tags.
    pub interests: String,
    /// pending, processing, completed, failed
    pub processing_status: String,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub completed_at: Option<i64>,
    /// Empty until the itinerary completes.
    pub generated_content: String,
    pub model_used: Option<String>,
    pub pdf_filename: Option<String>,
    pub pdf_path: Option<String>,
}

impl Itinerary {
    pub fn status(&self) -> Option<ProcessingStatus> {
        ProcessingStatus::parse(&self.processing_status)
    }

    /// Decoded interest tags. Malformed JSON reads as no interests.
    pub fn interest_tags(&self) -> Vec<String> {
        serde_json::from_str(&self.interests).unwrap_or_default()
    }

    /// Inclusive trip length in days.
    pub fn trip_days(&self) -> i64 {
        (self.end_date - self.start_date).num_days() + 1
    }

    /// Whether every output field is populated.
    pub fn has_outputs(&self) -> bool {
        !self.generated_content.is_empty()
            && self.model_used.as_deref().is_some_and(|m| !m.is_empty())
            && self.pdf_filename.as_deref().is_some_and(|f| !f.is_empty())
            && self.pdf_path.as_deref().is_some_and(|p| !p.is_empty())
    }
}

/// Request payload for a new itinerary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewItinerary {
    pub client_id: String,
    pub session_id: Option<String>,
    pub destination: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub budget: Option<String>,
    pub interests: Vec<String>,
}

impl NewItinerary {
    pub fn new(
        client_id: impl Into<String>,
        destination: impl Into<String>,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            session_id: None,
            destination: destination.into(),
            start_date,
            end_date,
            budget: None,
            interests: Vec::new(),
        }
    }

    pub fn with_budget(mut self, budget: impl Into<String>) -> Self {
        self.budget = Some(budget.into());
        self
    }

    pub fn with_interests<I, S>(mut self, interests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interests = interests.into_iter().map(Into::into).collect();
        self
    }
}

/// Itinerary processing lifecycle.
///
/// Transitions only move forward: pending, processing, then completed or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
