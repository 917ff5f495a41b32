//! §4.4 seat and invite state, held entirely in Redis so any instance can
//! serve any room.

pub mod model;
pub mod repository;

pub use model::{Invite, LockOutcome, Seat};
pub use repository::SeatRepository;
