//! §3 `GiftTransaction` — the unit of work the gift buffer batches and
//! submits to the business backend.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GiftTransaction {
    #[serde(rename = "transactionId")]
    pub transaction_id: Uuid,
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "senderUserId")]
    pub sender_user_id: String,
    #[serde(rename = "recipientUserId")]
    pub recipient_user_id: String,
    #[serde(rename = "giftId")]
    pub gift_id: String,
    pub quantity: u32,
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: i64,
    #[serde(rename = "senderConnectionId")]
    pub sender_connection_id: String,
    #[serde(rename = "retryCount", default)]
    pub retry_count: u32,
}
