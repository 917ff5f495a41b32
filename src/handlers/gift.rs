//! §4.6 `gift:send` / `gift:prepare`.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use slog::{o, Logger};
use uuid::Uuid;

use crate::clients::ClientRegistry;
use crate::error::{AppError, AppResult};
use crate::gifts::{GiftBuffer, GiftTransaction};
use crate::ratelimit::RateLimiter;
use crate::rooms::RoomRegistry;
use crate::users::UserSocketRegistry;

use super::Broadcaster;

const MIN_QUANTITY: u32 = 1;
const MAX_QUANTITY: u32 = 9999;

#[derive(Debug, Deserialize)]
pub struct SendGiftRequest {
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "recipientUserId")]
    pub recipient_user_id: String,
    #[serde(rename = "giftId")]
    pub gift_id: String,
    pub quantity: u32,
}

#[derive(Debug, Deserialize)]
pub struct PrepareGiftRequest {
    #[serde(rename = "recipientUserId")]
    pub recipient_user_id: String,
    #[serde(rename = "giftId")]
    pub gift_id: String,
}

pub struct GiftHandlers {
    buffer: Arc<GiftBuffer>,
    registry: Arc<RoomRegistry>,
    clients: Arc<ClientRegistry>,
    sockets: Arc<UserSocketRegistry>,
    rate_limiter: Arc<RateLimiter>,
    rate_limit_events: u32,
    rate_limit_window: Duration,
    broadcaster: Arc<dyn Broadcaster>,
    log: Logger,
}

impl GiftHandlers {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        buffer: Arc<GiftBuffer>,
        registry: Arc<RoomRegistry>,
        clients: Arc<ClientRegistry>,
        sockets: Arc<UserSocketRegistry>,
        rate_limiter: Arc<RateLimiter>,
        rate_limit_events: u32,
        rate_limit_window: Duration,
        broadcaster: Arc<dyn Broadcaster>,
        log: Logger,
    ) -> Self {
        Self {
            buffer,
            registry,
            clients,
            sockets,
            rate_limiter,
            rate_limit_events,
            rate_limit_window,
            broadcaster,
            log: log.new(o!("component" => "gift_handlers")),
        }
    }

    /// §4.6 `gift:send`. Validates, rate-limits per sender, enqueues onto
    /// the durable buffer, and broadcasts to the room before the backend
    /// has necessarily confirmed the transaction — §9 treats gift delivery
    /// as at-least-once and eventually consistent with the room view.
    pub async fn send(
        &self,
        connection_id: &str,
        req: SendGiftRequest,
    ) -> AppResult<()> {
        if !(MIN_QUANTITY..=MAX_QUANTITY).contains(&req.quantity) {
            return Err(AppError::InvalidPayload);
        }
        let sender_user_id = self
            .clients
            .user_id_of(connection_id)
            .await
            .ok_or(AppError::NotInRoom)?;
        if self.clients.room_id_of(connection_id).await.as_deref() != Some(&req.room_id) {
            return Err(AppError::NotInRoom);
        }
        if req.recipient_user_id == sender_user_id {
            return Err(AppError::CannotGiftSelf);
        }

        let allowed = self
            .rate_limiter
            .check(
                &format!("gift:{}", sender_user_id),
                self.rate_limit_events,
                self.rate_limit_window,
            )
            .await
            .map_err(AppError::from)?;
        if !allowed {
            return Err(AppError::RateLimited);
        }

        let transaction = GiftTransaction {
            transaction_id: Uuid::new_v4(),
            room_id: req.room_id.clone(),
            sender_user_id: sender_user_id.clone(),
            recipient_user_id: req.recipient_user_id.clone(),
            gift_id: req.gift_id.clone(),
            quantity: req.quantity,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            sender_connection_id: connection_id.to_string(),
            retry_count: 0,
        };
        self.buffer.enqueue(&transaction).await.map_err(AppError::from)?;

        if let Err(e) = self.registry.touch_activity(&req.room_id).await {
            slog::warn!(self.log, "failed to touch room activity on gift send";
                "room_id" => &req.room_id, "error" => %e);
        }

        // Explicit field whitelist: the wire event never carries buffer
        // bookkeeping (retryCount, senderConnectionId).
        self.broadcaster.to_room(
            &req.room_id,
            None,
            "gift:received",
            serde_json::json!({
                "transactionId": transaction.transaction_id,
                "roomId": transaction.room_id,
                "senderUserId": transaction.sender_user_id,
                "recipientUserId": transaction.recipient_user_id,
                "giftId": transaction.gift_id,
                "quantity": transaction.quantity,
                "timestampMs": transaction.timestamp_ms,
            }),
        );
        Ok(())
    }

    /// §4.6 `gift:prepare`. A pre-load hint for the recipient's own
    /// sockets only — never broadcast to the room.
    pub async fn prepare(
        &self,
        connection_id: &str,
        req: PrepareGiftRequest,
    ) -> AppResult<()> {
        let sender_user_id = self
            .clients
            .user_id_of(connection_id)
            .await
            .ok_or(AppError::NotInRoom)?;
        let sockets = self
            .sockets
            .sockets_for(&req.recipient_user_id)
            .await
            .map_err(AppError::from)?;
        self.broadcaster.to_sockets(
            &sockets,
            "gift:prepare",
            serde_json::json!({
                "giftId": req.gift_id, "senderUserId": sender_user_id,
            }),
        );
        Ok(())
    }
}
