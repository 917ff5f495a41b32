//! §3 `Seat`/`Invite` entities as they cross the Redis boundary.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Seat {
    pub index: u32,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub muted: bool,
    pub locked: bool,
}

/// The JSON shape stored in the `seats:{roomId}` hash field — no `index`
/// or `locked`, since those live in the field name and the `locked:{roomId}`
/// set respectively.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub(super) struct SeatRecord {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    pub muted: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Invite {
    /// Not part of the stored JSON (the key name already carries it) —
    /// filled in by the repository after deserializing.
    #[serde(skip, default)]
    pub seat_index: u32,
    #[serde(rename = "targetUserId")]
    pub target_user_id: String,
    #[serde(rename = "inviterUserId")]
    pub inviter_user_id: String,
    #[serde(rename = "createdAtMs")]
    pub created_at_ms: i64,
}

/// Outcome of `lockSeat`, carrying the vacated occupant (if any) so the
/// handler can notify them separately from the lock broadcast.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LockOutcome {
    #[serde(rename = "kickedUserId")]
    pub kicked_user_id: Option<String>,
}
