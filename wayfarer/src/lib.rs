//! wayfarer: asynchronous itinerary generation.
//!
//! Itineraries are created in SQLite and processed out of band: a
//! [`DispatchController`](pipeline::DispatchController) queues the work (or
//! runs it directly when the queue is down), a worker pool drives the
//! [`ProcessingPipeline`](pipeline::ProcessingPipeline), and a stuck-job
//! monitor recovers itineraries that were never picked up.

pub mod config;
pub mod database;
pub mod error;
pub mod generation;
pub mod logging;
pub mod pipeline;
pub mod render;
pub mod service;

pub use error::{Error, Result};
