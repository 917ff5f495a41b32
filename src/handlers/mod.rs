//! §4.6 handler contract surface — request validation, state mutation,
//! and the broadcasts each request triggers.
//!
//! §9's "god context" note rules out one bag of services threaded through
//! every handler: each handler family (`RoomHandlers`, `SeatHandlers`,
//! `MediaHandlers`, `GiftHandlers`) declares only the collaborators it
//! actually needs, mirroring the teacher's per-endpoint `AppContext` slices
//! rather than a single monolithic state struct.

pub mod gift;
pub mod media;
pub mod room;
pub mod seat;

use serde_json::Value;

/// What a handler needs from the session layer to fan broadcasts out,
/// without depending on actix itself. `session.rs` implements this over
/// its `Recipient<Notification>` maps (grounded on
/// `mock/control-api/src/api/ws.rs`'s `Subscribers`).
pub trait Broadcaster: Send + Sync {
    /// Emits `event` to every connection in `room_id`, optionally skipping
    /// one (the requester, when the requester already got its own ack).
    fn to_room(
        &self,
        room_id: &str,
        exclude_connection_id: Option<&str>,
        event: &str,
        payload: Value,
    );

    fn to_connection(&self, connection_id: &str, event: &str, payload: Value);

    fn to_sockets(&self, socket_ids: &[String], event: &str, payload: Value);

    /// Whether `connection_id` still has a live socket. Used by
    /// `ClientRegistry::snapshot_room` to prune stale entries during
    /// room:join assembly (§4.6).
    fn is_connected(&self, connection_id: &str) -> bool;
}

pub use gift::GiftHandlers;
pub use media::MediaHandlers;
pub use room::RoomHandlers;
pub use seat::SeatHandlers;
