//! Repository layer for database access.

pub mod itinerary;
pub mod job;

pub use itinerary::*;
pub use job::*;
