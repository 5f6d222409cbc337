//! The generation request for an itinerary and the prompt sent to the model.

use tera::{Context, Tera};

use crate::Result;
use crate::database::models::Itinerary;

const PROMPT: &str = include_str!("../../templates/prompt.txt");

/// The inputs a generation prompt is built from.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub destination: String,
    pub start_date: chrono::NaiveDate,
    pub end_date: chrono::NaiveDate,
    pub budget: Option<String>,
    pub interests: Vec<String>,
}

impl GenerationRequest {
    pub fn from_itinerary(itinerary: &Itinerary) -> Self {
        Self {
            destination: itinerary.destination.clone(),
            start_date: itinerary.start_date,
            end_date: itinerary.end_date,
            budget: itinerary.budget.clone(),
            interests: itinerary.interest_tags(),
        }
    }

    pub fn days(&self) -> i64 {
        (self.end_date - self.start_date).num_days() + 1
    }

    pub fn to_prompt(&self) -> Result<String> {
        let budget = self.budget.as_deref().map(str::trim).unwrap_or_default();

        let mut context = Context::new();
        context.insert("destination", &self.destination);
        context.insert("start_date", &self.start_date.format("%Y-%m-%d").to_string());
        context.insert("end_date", &self.end_date.format("%Y-%m-%d").to_string());
        context.insert("days", &self.days());
        context.insert("budget", budget);
        context.insert("interests", &self.interests);
        Ok(Tera::one_off(PROMPT, &context, false)?)
    }
}
