//! §4.7 `UserSocketRegistry`.

pub mod socket_registry;

pub use socket_registry::UserSocketRegistry;
