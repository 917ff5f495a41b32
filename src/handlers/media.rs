//! §4.6 `transport:*` / `audio:*` / `consumer:resume` handlers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use slog::{o, Logger};

use crate::clients::ClientRegistry;
use crate::error::{AppError, AppResult};
use crate::media::cluster::{ConsumerInfo, TransportInfo};
use crate::media::engine::{ConsumerId, ProducerId, TransportId, TransportRole};
use crate::rooms::RoomRegistry;
use crate::seats::SeatRepository;

use super::seat::SeatHandlers;
use super::Broadcaster;

const MAX_TRANSPORTS_PER_CONNECTION: usize = 2;

#[derive(Debug, Deserialize)]
pub struct TransportCreateRequest {
    #[serde(rename = "roomId")]
    pub room_id: String,
    pub role: String,
}

#[derive(Debug, Deserialize)]
pub struct TransportConnectRequest {
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "transportId")]
    pub transport_id: String,
    #[serde(rename = "dtlsParameters")]
    pub dtls_parameters: Value,
}

#[derive(Debug, Deserialize)]
pub struct ProduceRequest {
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "transportId")]
    pub transport_id: String,
    pub kind: String,
    #[serde(rename = "rtpParameters")]
    pub rtp_parameters: Value,
    #[serde(rename = "appData", default)]
    pub app_data: Value,
}

#[derive(Debug, Serialize)]
pub struct ProduceResponse {
    #[serde(rename = "producerId")]
    pub producer_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "transportId")]
    pub transport_id: String,
    #[serde(rename = "producerId")]
    pub producer_id: String,
    #[serde(rename = "rtpCapabilities")]
    pub rtp_capabilities: Value,
}

#[derive(Debug, Deserialize)]
pub struct ConsumerResumeRequest {
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "consumerId")]
    pub consumer_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SelfMuteRequest {
    #[serde(rename = "roomId")]
    pub room_id: String,
}

pub struct MediaHandlers {
    registry: Arc<RoomRegistry>,
    clients: Arc<ClientRegistry>,
    seats: Arc<SeatRepository>,
    seat_handlers: Arc<SeatHandlers>,
    broadcaster: Arc<dyn Broadcaster>,
    log: Logger,
}

impl MediaHandlers {
    #[must_use]
    pub fn new(
        registry: Arc<RoomRegistry>,
        clients: Arc<ClientRegistry>,
        seats: Arc<SeatRepository>,
        seat_handlers: Arc<SeatHandlers>,
        broadcaster: Arc<dyn Broadcaster>,
        log: Logger,
    ) -> Self {
        Self {
            registry,
            clients,
            seats,
            seat_handlers,
            broadcaster,
            log: log.new(o!("component" => "media_handlers")),
        }
    }

    async fn cluster_for(
        &self,
        room_id: &str,
    ) -> AppResult<Arc<crate::media::cluster::MediaCluster>> {
        self.registry.get(room_id).await.ok_or(AppError::RoomNotFound)
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

    fn parse_role(role: &str) -> AppResult<TransportRole> {
        match role {
            "producer" => Ok(TransportRole::Producer),
            "consumer" => Ok(TransportRole::Consumer),
            _ => Err(AppError::InvalidPayload),
        }
    }

    /// §4.2/§4.6 `transport:create`. Caps a connection at
    /// [`MAX_TRANSPORTS_PER_CONNECTION`] — one producer, one consumer.
    pub async fn create_transport(
        &self,
        connection_id: &str,
        req: TransportCreateRequest,
    ) -> AppResult<TransportInfo> {
        if self.clients.room_id_of(connection_id).await.as_deref() != Some(&req.room_id) {
            return Err(AppError::NotInRoom);
        }
        if self.clients.transport_count(connection_id).await >= MAX_TRANSPORTS_PER_CONNECTION {
            return Err(AppError::TransportLimitReached);
        }
        let role = Self::parse_role(&req.role)?;
        let cluster = self.cluster_for(&req.room_id).await?;
        let info = cluster.create_transport(role).await.map_err(AppError::from)?;
        self.clients
            .add_transport(connection_id, TransportId(info.id.clone()), role)
            .await;
        Ok(info)
    }

    pub async fn connect_transport(
        &self,
        _connection_id: &str,
        req: TransportConnectRequest,
    ) -> AppResult<()> {
        let cluster = self.cluster_for(&req.room_id).await?;
        cluster
            .connect_transport(&TransportId(req.transport_id), req.dtls_parameters)
            .await
    }

    /// §4.6 `audio:produce`. Broadcasts `audio:newProducer` once
    /// registration (and every distribution-router pipe) has completed —
    /// the pipe-then-notify invariant (§4.2, §9).
    pub async fn produce(
        &self,
        connection_id: &str,
        req: ProduceRequest,
    ) -> AppResult<ProduceResponse> {
        let user_id = self
            .clients
            .user_id_of(connection_id)
            .await
            .ok_or(AppError::NotInRoom)?;
        let cluster = self.cluster_for(&req.room_id).await?;
        let producer_id = cluster
            .produce(
                &TransportId(req.transport_id),
                &req.kind,
                req.rtp_parameters,
                req.app_data,
            )
            .await?;

        self.clients
            .add_producer(connection_id, req.kind.clone(), producer_id.clone())
            .await;
        if let Err(e) = self.registry.touch_activity(&req.room_id).await {
            slog::warn!(self.log, "failed to touch room activity on produce";
                "room_id" => &req.room_id, "error" => %e);
        }

        self.broadcaster.to_room(
            &req.room_id,
            Some(connection_id),
            "audio:newProducer",
            serde_json::json!({
                "producerId": producer_id.to_string(), "userId": user_id, "kind": req.kind,
            }),
        );

        Ok(ProduceResponse {
            producer_id: producer_id.to_string(),
        })
    }

    pub async fn consume(
        &self,
        connection_id: &str,
        req: ConsumeRequest,
    ) -> AppResult<ConsumerInfo> {
        let cluster = self.cluster_for(&req.room_id).await?;
        let info = cluster
            .consume(
                &TransportId(req.transport_id),
                &ProducerId(req.producer_id.clone()),
                req.rtp_capabilities,
            )
            .await?;
        self.clients
            .add_consumer(
                connection_id,
                ProducerId(req.producer_id),
                ConsumerId(info.id.clone()),
            )
            .await;
        Ok(info)
    }

    pub async fn resume_consumer(
        &self,
        _connection_id: &str,
        req: ConsumerResumeRequest,
    ) -> AppResult<()> {
        let cluster = self.cluster_for(&req.room_id).await?;
        cluster.resume_consumer(&ConsumerId(req.consumer_id)).await
    }

    /// §4.6 `audio:selfMute`/`selfUnmute`. Mutes are seat-scoped rather
    /// than producer-scoped: the seat record is the source of truth other
    /// participants see, so it's updated (and the room notified) even for
    /// a user with no live producer yet.
    async fn set_self_mute(
        &self,
        connection_id: &str,
        room_id: &str,
        muted: bool,
    ) -> AppResult<()> {
        let user_id = self
            .clients
            .user_id_of(connection_id)
            .await
            .ok_or(AppError::NotInRoom)?;
        let max = self.max_seats(room_id).await?;
        let seats = self.seats.get_seats(room_id, max).await.map_err(AppError::from)?;
        let seat = seats
            .into_iter()
            .find(|s| s.user_id.as_deref() == Some(user_id.as_str()))
            .ok_or(AppError::UserNotSeated)?;

        self.seats.set_mute(room_id, seat.index, muted).await?;
        self.seat_handlers
            .apply_producer_mute(room_id, &user_id, muted)
            .await;
        self.broadcaster.to_room(
            room_id,
            None,
            "seat:userMuted",
            serde_json::json!({
                "seatIndex": seat.index, "userId": user_id,
                "isMuted": muted, "selfMuted": true,
            }),
        );
        Ok(())
    }

    pub async fn self_mute(
        &self,
        connection_id: &str,
        req: SelfMuteRequest,
    ) -> AppResult<()> {
        self.set_self_mute(connection_id, &req.room_id, true).await
    }

    pub async fn self_unmute(
        &self,
        connection_id: &str,
        req: SelfMuteRequest,
    ) -> AppResult<()> {
        self.set_self_mute(connection_id, &req.room_id, false).await
    }
}
