//! Minimal Markdown to HTML conversion for the PDF template.
//!
//! Handles the subset the generator is asked to produce: headings, bullet
//! lists, bold spans and paragraphs. The page itself is a tera template with
//! autoescaping on, so every piece of text reaching it is escaped there.

use serde::Serialize;
use tera::{Context, Tera};

use crate::Result;
use crate::database::models::Itinerary;

const PAGE: &str = include_str!("../../templates/itinerary.html");

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Span {
    text: String,
    strong: bool,
}

/// One rendered line: a heading, list item or paragraph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Block {
    tag: &'static str,
    spans: Vec<Span>,
    opens_list: bool,
    closes_list: bool,
}

/// Split `s` on `**` pairs. An unclosed marker runs to the end of the line.
fn spans(s: &str) -> Vec<Span> {
    s.split("**")
        .enumerate()
        .filter(|(_, text)| !text.is_empty())
        .map(|(i, text)| Span {
            text: text.to_string(),
            strong: i % 2 == 1,
        })
        .collect()
}

fn close_list(blocks: &mut [Block]) {
    if let Some(last) = blocks.last_mut() {
        last.closes_list = true;
    }
}

fn blocks(content: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut in_list = false;

    for line in content.lines() {
        let trimmed = line.trim();

        let bullet = trimmed
            .strip_prefix("- ")
            .or_else(|| trimmed.strip_prefix("* "));

        if bullet.is_none() && in_list {
            close_list(&mut blocks);
            in_list = false;
        }

        let (tag, text) = if let Some(item) = bullet {
            ("li", item)
        } else if let Some(h) = trimmed.strip_prefix("### ") {
            ("h3", h)
        } else if let Some(h) = trimmed.strip_prefix("## ") {
            ("h2", h)
        } else if let Some(h) = trimmed.strip_prefix("# ") {
            ("h1", h)
        } else if trimmed.is_empty() {
            continue;
        } else {
            ("p", trimmed)
        };

        let opens_list = bullet.is_some() && !in_list;
        in_list |= bullet.is_some();
        blocks.push(Block {
            tag,
            spans: spans(text),
            opens_list,
            closes_list: false,
        });
    }

    if in_list {
        close_list(&mut blocks);
    }
    blocks
}

/// A standalone HTML document for `itinerary` with `content` as its body.
pub fn render_html(itinerary: &Itinerary, content: &str) -> Result<String> {
    let mut context = Context::new();
    context.insert("destination", &itinerary.destination);
    context.insert(
        "start",
        &itinerary.start_date.format("%B %-d, %Y").to_string(),
    );
    context.insert("end", &itinerary.end_date.format("%B %-d, %Y").to_string());
    context.insert("blocks", &blocks(content));
    Ok(Tera::one_off(PAGE, &context, true)?)
}
