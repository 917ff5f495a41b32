//! §3 `Room` entity as persisted at `room:state:{roomId}`.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Active,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoomState {
    pub status: RoomStatus,
    #[serde(rename = "seatCount")]
    pub seat_count: u32,
    #[serde(rename = "participantCount")]
    pub participant_count: i64,
    #[serde(rename = "createdAtMs")]
    pub created_at_ms: i64,
    #[serde(rename = "lastActivityAtMs")]
    pub last_activity_at_ms: i64,
    #[serde(rename = "ownerUserId", skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<String>,
}

impl RoomState {
    #[must_use]
    pub fn fresh(now_ms: i64, default_seat_count: u32) -> Self {
        Self {
            status: RoomStatus::Active,
            seat_count: default_seat_count,
            participant_count: 0,
            created_at_ms: now_ms,
            last_activity_at_ms: now_ms,
            owner_user_id: None,
        }
    }
}
