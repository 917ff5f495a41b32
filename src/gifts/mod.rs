//! §4.9 `GiftBuffer` and the `GiftTransaction` entity it queues.

pub mod buffer;
pub mod model;

pub use buffer::{GiftBuffer, OnGiftError};
pub use model::GiftTransaction;
