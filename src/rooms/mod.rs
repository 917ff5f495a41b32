//! §4.5 `RoomRegistry` and the `Room`/`RoomState` entity it persists.

pub mod model;
pub mod registry;

pub use model::{RoomState, RoomStatus};
pub use registry::RoomRegistry;
