//! §4.6 `seat:*` handlers — take, leave, assign, remove, mute, unmute,
//! lock, unlock, invite, invite:accept, invite:decline.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use slog::{o, warn, Logger};

use crate::clients::ClientRegistry;
use crate::error::{AppError, AppResult};
use crate::rooms::RoomRegistry;
use crate::seats::SeatRepository;
use crate::users::UserSocketRegistry;

use super::Broadcaster;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Deserialize)]
pub struct SeatIndexRequest {
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "seatIndex")]
    pub seat_index: u32,
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "seatIndex")]
    pub seat_index: u32,
    #[serde(rename = "userId")]
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RemoveRequest {
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct MuteRequest {
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "seatIndex")]
    pub seat_index: u32,
    pub muted: bool,
}

#[derive(Debug, Deserialize)]
pub struct InviteRequest {
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "seatIndex")]
    pub seat_index: u32,
    #[serde(rename = "targetUserId")]
    pub target_user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RoomOnlyRequest {
    #[serde(rename = "roomId")]
    pub room_id: String,
}

pub struct SeatHandlers {
    seats: Arc<SeatRepository>,
    registry: Arc<RoomRegistry>,
    clients: Arc<ClientRegistry>,
    sockets: Arc<UserSocketRegistry>,
    broadcaster: Arc<dyn Broadcaster>,
    invite_expiry: Duration,
    log: Logger,
}

impl SeatHandlers {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        seats: Arc<SeatRepository>,
        registry: Arc<RoomRegistry>,
        clients: Arc<ClientRegistry>,
        sockets: Arc<UserSocketRegistry>,
        broadcaster: Arc<dyn Broadcaster>,
        invite_expiry: Duration,
        log: Logger,
    ) -> Self {
        Self {
            seats,
            registry,
            clients,
            sockets,
            broadcaster,
            invite_expiry,
            log: log.new(o!("component" => "seat_handlers")),
        }
    }

    async fn user_id(&self, connection_id: &str) -> AppResult<String> {
        self.clients
            .user_id_of(connection_id)
            .await
            .ok_or(AppError::NotInRoom)
    }

    async fn max_seats(&self, room_id: &str) -> AppResult<u32> {
        Ok(self
            .registry
            .read_room_state(room_id)
            .await
            .map_err(AppError::from)?
            .ok_or(AppError::RoomNotFound)?
            .seat_count)
    }

    /// Only the room's recorded owner may run a managed seat operation.
    async fn assert_manager(&self, room_id: &str, acting_user_id: &str) -> AppResult<()> {
        let state = self
            .registry
            .read_room_state(room_id)
            .await
            .map_err(AppError::from)?
            .ok_or(AppError::RoomNotFound)?;
        match state.owner_user_id {
            Some(owner) if owner == acting_user_id => Ok(()),
            _ => Err(AppError::NotAuthorized),
        }
    }

    /// Closes every producer a user owns in the room server-side — used
    /// when lockSeat vacates an occupant (§4.4: relying on the client to
    /// release it is not acceptable).
    async fn close_user_producers(&self, room_id: &str, user_id: &str) {
        let cluster = match self.registry.get(room_id).await {
            Some(c) => c,
            None => return,
        };
        if let Some(connection_id) = self
            .clients
            .connection_id_for_user_in_room(room_id, user_id)
            .await
        {
            for producer_id in self.clients.producer_ids_of(&connection_id).await {
                if let Err(e) = cluster.close_producer(&producer_id).await {
                    warn!(self.log, "failed to close kicked occupant's producer";
                        "room_id" => room_id, "user_id" => user_id, "error" => %e);
                }
                self.clients.clear_producer(&connection_id, &producer_id).await;
            }
        }
    }

    /// Applies a mute state change to every producer a user owns in the
    /// room, shared by manager-driven `seat:mute` and the self-service
    /// `audio:selfMute`/`selfUnmute` path in `MediaHandlers`.
    pub(super) async fn apply_producer_mute(&self, room_id: &str, user_id: &str, muted: bool) {
        let cluster = match self.registry.get(room_id).await {
            Some(c) => c,
            None => return,
        };
        if let Some(connection_id) = self
            .clients
            .connection_id_for_user_in_room(room_id, user_id)
            .await
        {
            for producer_id in self.clients.producer_ids_of(&connection_id).await {
                let result = if muted {
                    cluster.pause_producer(&producer_id).await
                } else {
                    cluster.resume_producer(&producer_id).await
                };
                if let Err(e) = result {
                    warn!(self.log, "failed to pause/resume producer on mute change";
                        "room_id" => room_id, "user_id" => user_id, "error" => %e);
                }
            }
        }
    }

    pub async fn take(&self, connection_id: &str, req: SeatIndexRequest) -> AppResult<()> {
        let user_id = self.user_id(connection_id).await?;
        let max = self.max_seats(&req.room_id).await?;
        self.seats
            .take_seat(&req.room_id, &user_id, req.seat_index, max)
            .await?;
        self.registry
            .touch_activity(&req.room_id)
            .await
            .map_err(AppError::from)?;
        self.broadcaster.to_room(
            &req.room_id,
            None,
            "seat:updated",
            serde_json::json!({ "seatIndex": req.seat_index, "userId": user_id, "isMuted": false }),
        );
        Ok(())
    }

    pub async fn leave(&self, connection_id: &str, req: RoomOnlyRequest) -> AppResult<()> {
        let user_id = self.user_id(connection_id).await?;
        let index = self.seats.remove_seat(&req.room_id, &user_id).await?;
        self.broadcaster.to_room(
            &req.room_id,
            None,
            "seat:cleared",
            serde_json::json!({ "seatIndex": index }),
        );
        Ok(())
    }

    pub async fn assign(&self, connection_id: &str, req: AssignRequest) -> AppResult<()> {
        let acting_user_id = self.user_id(connection_id).await?;
        self.assert_manager(&req.room_id, &acting_user_id).await?;
        let max = self.max_seats(&req.room_id).await?;
        self.seats
            .assign_seat(&req.room_id, &req.user_id, req.seat_index, max)
            .await?;
        self.broadcaster.to_room(
            &req.room_id,
            None,
            "seat:updated",
            serde_json::json!({
                "seatIndex": req.seat_index, "userId": req.user_id, "isMuted": false,
            }),
        );
        Ok(())
    }

    pub async fn remove(&self, connection_id: &str, req: RemoveRequest) -> AppResult<()> {
        let acting_user_id = self.user_id(connection_id).await?;
        self.assert_manager(&req.room_id, &acting_user_id).await?;
        let index = self.seats.remove_seat(&req.room_id, &req.user_id).await?;
        self.close_user_producers(&req.room_id, &req.user_id).await;
        self.broadcaster.to_room(
            &req.room_id,
            None,
            "seat:cleared",
            serde_json::json!({ "seatIndex": index }),
        );
        Ok(())
    }

    /// Manager-driven mute/unmute. Distinct from the self-service path in
    /// `MediaHandlers::self_mute`, which carries `selfMuted: true`.
    pub async fn set_mute(&self, connection_id: &str, req: MuteRequest) -> AppResult<()> {
        let acting_user_id = self.user_id(connection_id).await?;
        self.assert_manager(&req.room_id, &acting_user_id).await?;
        self.seats
            .set_mute(&req.room_id, req.seat_index, req.muted)
            .await?;

        let max = self.max_seats(&req.room_id).await?;
        let seats = self.seats.get_seats(&req.room_id, max).await?;
        if let Some(seat) = seats.into_iter().find(|s| s.index == req.seat_index) {
            if let Some(target_user_id) = &seat.user_id {
                self.apply_producer_mute(&req.room_id, target_user_id, req.muted)
                    .await;
                self.broadcaster.to_room(
                    &req.room_id,
                    None,
                    "seat:userMuted",
                    serde_json::json!({
                        "seatIndex": req.seat_index, "userId": target_user_id,
                        "isMuted": req.muted, "selfMuted": false,
                    }),
                );
            }
        }
        Ok(())
    }

    pub async fn lock(&self, connection_id: &str, req: SeatIndexRequest) -> AppResult<()> {
        let acting_user_id = self.user_id(connection_id).await?;
        self.assert_manager(&req.room_id, &acting_user_id).await?;
        let outcome = self.seats.lock_seat(&req.room_id, req.seat_index).await?;
        if let Some(kicked) = &outcome.kicked_user_id {
            self.close_user_producers(&req.room_id, kicked).await;
            self.broadcaster.to_room(
                &req.room_id,
                None,
                "seat:cleared",
                serde_json::json!({ "seatIndex": req.seat_index }),
            );
        }
        self.broadcaster.to_room(
            &req.room_id,
            None,
            "seat:locked",
            serde_json::json!({ "seatIndex": req.seat_index, "isLocked": true }),
        );
        Ok(())
    }

    pub async fn unlock(&self, connection_id: &str, req: SeatIndexRequest) -> AppResult<()> {
        let acting_user_id = self.user_id(connection_id).await?;
        self.assert_manager(&req.room_id, &acting_user_id).await?;
        self.seats.unlock_seat(&req.room_id, req.seat_index).await?;
        self.broadcaster.to_room(
            &req.room_id,
            None,
            "seat:locked",
            serde_json::json!({ "seatIndex": req.seat_index, "isLocked": false }),
        );
        Ok(())
    }

    pub async fn invite(&self, connection_id: &str, req: InviteRequest) -> AppResult<()> {
        let inviter_user_id = self.user_id(connection_id).await?;
        self.assert_manager(&req.room_id, &inviter_user_id).await?;
        if req.target_user_id == inviter_user_id {
            return Err(AppError::CannotInviteSelf);
        }
        let created = self
            .seats
            .create_invite(
                &req.room_id,
                req.seat_index,
                &req.target_user_id,
                &inviter_user_id,
                now_ms(),
                self.invite_expiry.as_secs(),
            )
            .await
            .map_err(AppError::from)?;
        if !created {
            return Err(AppError::InviteCreateFailed);
        }

        let sockets = self
            .sockets
            .sockets_for(&req.target_user_id)
            .await
            .map_err(AppError::from)?;
        self.broadcaster.to_sockets(
            &sockets,
            "seat:invite:received",
            serde_json::json!({
                "roomId": req.room_id, "seatIndex": req.seat_index,
                "inviterUserId": inviter_user_id,
            }),
        );
        Ok(())
    }

    /// §8 S4: accepting an invite bypasses the seat's lock — unlock, then
    /// seat the invitee. Expressed as sequential script calls rather than
    /// one atomic script because the invite itself already guarantees
    /// exclusivity on the target seat.
    pub async fn accept_invite(&self, connection_id: &str, req: RoomOnlyRequest) -> AppResult<()> {
        let user_id = self.user_id(connection_id).await?;
        let invite = self
            .seats
            .get_invite_by_user(&req.room_id, &user_id)
            .await
            .map_err(AppError::from)?
            .ok_or(AppError::NoInvite)?;

        self.seats
            .delete_invite(&req.room_id, invite.seat_index, &user_id)
            .await
            .map_err(AppError::from)?;
        match self.seats.unlock_seat(&req.room_id, invite.seat_index).await {
            Ok(()) | Err(AppError::SeatNotLocked) => {}
            Err(e) => return Err(e),
        }
        let max = self.max_seats(&req.room_id).await?;
        self.seats
            .assign_seat(&req.room_id, &user_id, invite.seat_index, max)
            .await?;

        self.broadcaster.to_room(
            &req.room_id,
            None,
            "seat:invite:pending",
            serde_json::json!({ "seatIndex": invite.seat_index, "isPending": false }),
        );
        self.broadcaster.to_room(
            &req.room_id,
            None,
            "seat:locked",
            serde_json::json!({ "seatIndex": invite.seat_index, "isLocked": false }),
        );
        self.broadcaster.to_room(
            &req.room_id,
            None,
            "seat:updated",
            serde_json::json!({
                "seatIndex": invite.seat_index, "userId": user_id, "isMuted": false,
            }),
        );
        Ok(())
    }

    pub async fn decline_invite(
        &self,
        connection_id: &str,
        req: RoomOnlyRequest,
    ) -> AppResult<()> {
        let user_id = self.user_id(connection_id).await?;
        let invite = self
            .seats
            .get_invite_by_user(&req.room_id, &user_id)
            .await
            .map_err(AppError::from)?
            .ok_or(AppError::NoInvite)?;
        self.seats
            .delete_invite(&req.room_id, invite.seat_index, &user_id)
            .await
            .map_err(AppError::from)?;
        self.broadcaster.to_room(
            &req.room_id,
            None,
            "seat:invite:pending",
            serde_json::json!({ "seatIndex": invite.seat_index, "isPending": false }),
        );
        Ok(())
    }
}
