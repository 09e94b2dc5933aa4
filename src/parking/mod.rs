//! Parking - Domain Types and Collaborators
//!
//! ## Responsibilities
//!
//! - Zone / place / booking / violation types used by the scanner
//! - Repository traits the scanner consumes
//! - Postgres store (production) and in-memory store (tests)

mod memory;
mod repository;
mod types;

pub use memory::InMemoryParkingStore;
pub use repository::{
    BookingRepository, CameraRepository, PgParkingStore, PlaceRepository, ViolationRepository,
    ZoneRepository,
};
pub use types::*;
