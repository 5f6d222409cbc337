//! Row models. These map directly onto the SQLite schema.

pub mod itinerary;
pub mod job;

pub use itinerary::*;
pub use job::*;
