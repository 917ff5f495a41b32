//! §4.6 `room:join` / `room:leave`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use slog::{o, warn, Logger};

use crate::backend::{BackendClient, RoomStatusUpdate};
use crate::clients::{ClientRegistry, Participant};
use crate::error::{AppError, AppResult};
use crate::rooms::RoomRegistry;
use crate::seats::SeatRepository;
use crate::users::UserSocketRegistry;

use super::Broadcaster;

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "seatCount", default)]
    pub seat_count: Option<u32>,
    #[serde(rename = "ownerId", default)]
    pub owner_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JoinResponse {
    #[serde(rename = "rtpCapabilities")]
    pub rtp_capabilities: Value,
    pub participants: Vec<Participant>,
    pub seats: Vec<crate::seats::Seat>,
    #[serde(rename = "lockedSeats")]
    pub locked_seats: Vec<u32>,
    #[serde(rename = "existingProducers")]
    pub existing_producers: Vec<ExistingProducer>,
}

#[derive(Debug, Serialize)]
pub struct ExistingProducer {
    #[serde(rename = "producerId")]
    pub producer_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct LeaveRequest {
    #[serde(rename = "roomId")]
    pub room_id: String,
}

pub struct RoomHandlers {
    registry: Arc<RoomRegistry>,
    clients: Arc<ClientRegistry>,
    sockets: Arc<UserSocketRegistry>,
    seats: Arc<SeatRepository>,
    backend: Arc<BackendClient>,
    broadcaster: Arc<dyn Broadcaster>,
    log: Logger,
}

impl RoomHandlers {
    #[must_use]
    pub fn new(
        registry: Arc<RoomRegistry>,
        clients: Arc<ClientRegistry>,
        sockets: Arc<UserSocketRegistry>,
        seats: Arc<SeatRepository>,
        backend: Arc<BackendClient>,
        broadcaster: Arc<dyn Broadcaster>,
        log: Logger,
    ) -> Self {
        Self {
            registry,
            clients,
            sockets,
            seats,
            backend,
            broadcaster,
            log: log.new(o!("component" => "room_handlers")),
        }
    }

    /// §4.6 `room:join`.
    pub async fn join(
        &self,
        connection_id: &str,
        user_id: &str,
        req: JoinRequest,
    ) -> AppResult<JoinResponse> {
        if req.room_id.is_empty() {
            return Err(AppError::InvalidPayload);
        }

        let cluster = self
            .registry
            .get_or_create(&req.room_id)
            .await
            .map_err(AppError::from)?;

        if let Some(seat_count) = req.seat_count {
            self.registry
                .set_seat_count_if_fresh(&req.room_id, seat_count)
                .await
                .map_err(AppError::from)?;
        }
        if let Some(owner_id) = &req.owner_id {
            self.registry
                .set_owner_if_absent(&req.room_id, owner_id)
                .await
                .map_err(AppError::from)?;
        }

        self.clients.set_room(connection_id, &req.room_id).await;

        let (count_result, room_result) = tokio::join!(
            self.registry.adjust_participant_count(&req.room_id, 1),
            self.sockets.set_user_room(user_id, &req.room_id),
        );
        let participant_count = count_result.map_err(AppError::from)?;
        if let Err(e) = room_result {
            warn!(self.log, "failed to record user->room mapping on join";
                "room_id" => &req.room_id, "error" => %e);
        }

        let broadcaster = Arc::clone(&self.broadcaster);
        let participants = self
            .clients
            .snapshot_room(&req.room_id, |id| broadcaster.is_connected(id))
            .await;

        let state = self
            .registry
            .read_room_state(&req.room_id)
            .await
            .map_err(AppError::from)?
            .ok_or(AppError::RoomNotFound)?;

        let seats = self
            .seats
            .get_seats(&req.room_id, state.seat_count)
            .await
            .map_err(AppError::from)?;
        let locked_seats = seats
            .iter()
            .filter(|s| s.locked)
            .map(|s| s.index)
            .collect();

        let existing_producers = self
            .clients
            .producers_in_room(&req.room_id)
            .await
            .into_iter()
            .map(|(producer_id, user_id)| ExistingProducer {
                producer_id: producer_id.to_string(),
                user_id,
            })
            .collect();

        let response = JoinResponse {
            rtp_capabilities: cluster.rtp_capabilities(),
            participants,
            seats,
            locked_seats,
            existing_producers,
        };

        self.broadcaster.to_room(
            &req.room_id,
            Some(connection_id),
            "room:userJoined",
            serde_json::json!({ "userId": user_id, "connectionId": connection_id }),
        );

        let backend = Arc::clone(&self.backend);
        let room_id = req.room_id.clone();
        tokio::spawn(async move {
            backend
                .notify_room_status_best_effort(
                    &room_id,
                    RoomStatusUpdate {
                        is_live: true,
                        participant_count: participant_count.max(0) as u32,
                        started_at: None,
                        ended_at: None,
                    },
                )
                .await;
        });

        Ok(response)
    }

    /// §4.6 `room:leave`.
    pub async fn leave(&self, connection_id: &str, req: LeaveRequest) -> AppResult<()> {
        if req.room_id.is_empty() {
            return Err(AppError::InvalidPayload);
        }
        let user_id = self
            .clients
            .user_id_of(connection_id)
            .await
            .ok_or(AppError::NotInRoom)?;

        match self.seats.remove_seat(&req.room_id, &user_id).await {
            Ok(index) => {
                self.broadcaster.to_room(
                    &req.room_id,
                    None,
                    "seat:cleared",
                    serde_json::json!({ "seatIndex": index }),
                );
            }
            Err(AppError::UserNotSeated) => {}
            Err(e) => return Err(e),
        }

        self.clients.leave_room(connection_id).await;

        let (count_result, clear_result) = tokio::join!(
            self.registry.adjust_participant_count(&req.room_id, -1),
            self.sockets.clear_user_room(&user_id),
        );
        if let Err(e) = count_result {
            warn!(self.log, "failed to decrement participant count on leave";
                "room_id" => &req.room_id, "error" => %e);
        }
        if let Err(e) = clear_result {
            warn!(self.log, "failed to clear user->room mapping on leave";
                "room_id" => &req.room_id, "error" => %e);
        }

        self.broadcaster.to_room(
            &req.room_id,
            Some(connection_id),
            "room:userLeft",
            serde_json::json!({ "userId": user_id, "connectionId": connection_id }),
        );

        Ok(())
    }
}
