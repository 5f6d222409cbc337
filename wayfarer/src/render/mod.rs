//! PDF rendering of generated itineraries.

mod command;
mod html;

pub use command::{CommandPdfRenderer, RendererConfig};
pub use html::render_html;

use async_trait::async_trait;

use crate::Result;
use crate::database::models::Itinerary;

/// A rendered document on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPdf {
    pub filename: String,
    pub path: String,
}

/// Turns generated content into a PDF for an itinerary.
#[async_trait]
pub trait PdfRenderer: Send + Sync {
    async fn render(&self, itinerary: &Itinerary, content: &str) -> Result<RenderedPdf>;
}

/// `itinerary-<id>-<destination-slug>`, used for both the HTML and PDF files.
pub fn file_stem(itinerary: &Itinerary) -> String {
    let mut slug = String::new();
    for ch in itinerary.destination.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    let slug: String = slug.chars().take(48).collect();

    if slug.is_empty() {
        format!("itinerary-{}", itinerary.id)
    } else {
        format!("itinerary-{}-{}", itinerary.id, slug)
    }
}
