//! §4.5 `RoomRegistry` — the per-instance map of live [`MediaCluster`]s
//! plus the Redis-backed room state record shared across instances.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use slog::{error, info, o, warn, Logger};
use tokio::sync::{Notify, RwLock};

use crate::backend::{BackendClient, RoomStatusUpdate};
use crate::error::InternalError;
use crate::media::cluster::MediaCluster;
use crate::media::worker_pool::WorkerPool;
use crate::redis_keys;
use crate::redis_pool::Pool;
use crate::seats::SeatRepository;

use super::model::RoomState;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

const ADJUST_COUNT: &str = r#"
local raw = redis.call("GET", KEYS[1])
if not raw then return -1 end
local obj = cjson.decode(raw)
obj.participantCount = obj.participantCount + tonumber(ARGV[1])
if obj.participantCount < 0 then obj.participantCount = 0 end
obj.lastActivityAtMs = tonumber(ARGV[2])
redis.call("SET", KEYS[1], cjson.encode(obj), "EX", 86400)
return obj.participantCount
"#;

/// Callback invoked before a room's resources are torn down, so the
/// session layer can broadcast `room:closed` to sockets still in it.
pub type OnRoomClosed = Box<dyn Fn(&str, &str) + Send + Sync>;

pub struct RoomRegistry {
    log: Logger,
    worker_pool: Arc<WorkerPool>,
    redis: Pool,
    seats: Arc<SeatRepository>,
    backend: Arc<BackendClient>,

    max_active_speakers: usize,
    active_speaker_window: Duration,
    max_listeners_per_router: usize,
    default_seat_count: u32,

    clusters: RwLock<HashMap<String, Arc<MediaCluster>>>,
    pending: RwLock<HashMap<String, Arc<Notify>>>,
    on_closed: RwLock<Vec<OnRoomClosed>>,
}

impl RoomRegistry {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_pool: Arc<WorkerPool>,
        redis: Pool,
        seats: Arc<SeatRepository>,
        backend: Arc<BackendClient>,
        max_active_speakers: usize,
        active_speaker_window: Duration,
        max_listeners_per_router: usize,
        default_seat_count: u32,
        log: Logger,
    ) -> Arc<Self> {
        Arc::new(Self {
            log: log.new(o!("component" => "room_registry")),
            worker_pool,
            redis,
            seats,
            backend,
            max_active_speakers,
            active_speaker_window,
            max_listeners_per_router,
            default_seat_count,
            clusters: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            on_closed: RwLock::new(Vec::new()),
        })
    }

    pub async fn on_room_closed(&self, callback: OnRoomClosed) {
        self.on_closed.write().await.push(callback);
    }

    /// Coalesces concurrent calls for the same `room_id` so at most one
    /// [`MediaCluster`] is constructed per room per instance (§4.5).
    pub async fn get_or_create(
        &self,
        room_id: &str,
    ) -> Result<Arc<MediaCluster>, InternalError> {
        loop {
            if let Some(cluster) = self.clusters.read().await.get(room_id) {
                return Ok(Arc::clone(cluster));
            }

            let mut pending = self.pending.write().await;
            if let Some(cluster) = self.clusters.read().await.get(room_id) {
                return Ok(Arc::clone(cluster));
            }
            if let Some(notify) = pending.get(room_id).cloned() {
                drop(pending);
                notify.notified().await;
                continue;
            }

            let notify = Arc::new(Notify::new());
            pending.insert(room_id.to_string(), Arc::clone(&notify));
            drop(pending);

            let result = self.create_cluster(room_id).await;
            if let Ok(cluster) = &result {
                self.clusters
                    .write()
                    .await
                    .insert(room_id.to_string(), Arc::clone(cluster));
            }
            self.pending.write().await.remove(room_id);
            notify.notify_waiters();
            return result;
        }
    }

    /// The room's cluster if one is already live on this instance, without
    /// creating one — used by handlers that must act on an existing room
    /// (seat management) rather than lazily join it.
    pub async fn get(&self, room_id: &str) -> Option<Arc<MediaCluster>> {
        self.clusters.read().await.get(room_id).cloned()
    }

    async fn create_cluster(
        &self,
        room_id: &str,
    ) -> Result<Arc<MediaCluster>, InternalError> {
        let cluster = MediaCluster::new(
            room_id.to_string(),
            Arc::clone(&self.worker_pool),
            self.max_active_speakers,
            self.active_speaker_window,
            self.max_listeners_per_router,
            self.log.clone(),
        )
        .await
        .map_err(|e| InternalError(failure::format_err!("{}", e)))?;

        let state = RoomState::fresh(now_ms(), self.default_seat_count);
        self.write_room_state(room_id, &state).await?;

        info!(self.log, "room created"; "room_id" => room_id);
        let backend = Arc::clone(&self.backend);
        let room_id_owned = room_id.to_string();
        tokio::spawn(async move {
            backend
                .notify_room_status_best_effort(
                    &room_id_owned,
                    RoomStatusUpdate {
                        is_live: true,
                        participant_count: 0,
                        started_at: Some(chrono::Utc::now().to_rfc3339()),
                        ended_at: None,
                    },
                )
                .await;
        });

        Ok(cluster)
    }

    /// Persists `seatCount` the first time a room:join carries an explicit
    /// value, as long as the room hasn't already diverged from the
    /// default (§3 "seatCount immutable after the first join").
    pub async fn set_seat_count_if_fresh(
        &self,
        room_id: &str,
        seat_count: u32,
    ) -> Result<(), InternalError> {
        if let Some(mut state) = self.read_room_state(room_id).await? {
            if state.seat_count == self.default_seat_count
                && state.participant_count == 0
            {
                state.seat_count = seat_count;
                self.write_room_state(room_id, &state).await?;
            }
        }
        Ok(())
    }

    /// Records `ownerUserId` the first time a room:join carries one, same
    /// freshness rule as `set_seat_count_if_fresh` — once set it sticks.
    pub async fn set_owner_if_absent(
        &self,
        room_id: &str,
        owner_user_id: &str,
    ) -> Result<(), InternalError> {
        if let Some(mut state) = self.read_room_state(room_id).await? {
            if state.owner_user_id.is_none() {
                state.owner_user_id = Some(owner_user_id.to_string());
                self.write_room_state(room_id, &state).await?;
            }
        }
        Ok(())
    }

    pub async fn read_room_state(
        &self,
        room_id: &str,
    ) -> Result<Option<RoomState>, InternalError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> =
            conn.get(redis_keys::room_state(room_id)).await?;
        raw.map(|s| serde_json::from_str(&s).map_err(InternalError::from))
            .transpose()
    }

    async fn write_room_state(
        &self,
        room_id: &str,
        state: &RoomState,
    ) -> Result<(), InternalError> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(state)?;
        let _: () = conn
            .set_ex(redis_keys::room_state(room_id), json, 86_400)
            .await?;
        Ok(())
    }

    /// Redis Lua script bumps `participantCount`/`lastActivityAtMs`
    /// atomically and returns the new count.
    pub async fn adjust_participant_count(
        &self,
        room_id: &str,
        delta: i64,
    ) -> Result<i64, InternalError> {
        let mut conn = self.conn().await?;
        let new_count: i64 = redis::Script::new(ADJUST_COUNT)
            .key(redis_keys::room_state(room_id))
            .arg(delta)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;
        if new_count < 0 {
            return Err(InternalError(failure::format_err!(
                "room state missing for room {}",
                room_id
            )));
        }
        Ok(new_count)
    }

    pub async fn touch_activity(&self, room_id: &str) -> Result<(), InternalError> {
        self.adjust_participant_count(room_id, 0).await.map(|_| ())
    }

    /// §4.5 `closeRoom`. Runs registered `on_closed` callbacks first (so
    /// the caller can broadcast to sockets still in the room), then tears
    /// down the cluster, clears seat state, deletes the room state record,
    /// and notifies the business backend fire-and-forget.
    pub async fn close_room(&self, room_id: &str, reason: &str) {
        let cluster = self.clusters.write().await.remove(room_id);
        if cluster.is_none() {
            return;
        }
        let cluster = cluster.unwrap();

        for cb in self.on_closed.read().await.iter() {
            cb(room_id, reason);
        }

        cluster.close().await;

        if let Err(e) = self.seats.clear_room(room_id).await {
            warn!(self.log, "failed to clear seat state on room close";
                "room_id" => room_id, "error" => %e);
        }

        if let Ok(mut conn) = self.conn().await {
            let _: Result<(), _> =
                conn.del(redis_keys::room_state(room_id)).await;
        }

        info!(self.log, "room closed"; "room_id" => room_id, "reason" => reason);

        let backend = Arc::clone(&self.backend);
        let room_id_owned = room_id.to_string();
        tokio::spawn(async move {
            backend
                .notify_room_status_best_effort(
                    &room_id_owned,
                    RoomStatusUpdate {
                        is_live: false,
                        participant_count: 0,
                        started_at: None,
                        ended_at: Some(chrono::Utc::now().to_rfc3339()),
                    },
                )
                .await;
        });
    }

    /// §4.1 worker-death hook: close every room whose cluster touches
    /// `worker_id`, concurrently, logging (not propagating) failures.
    pub async fn handle_worker_died(self: &Arc<Self>, worker_id: &str) {
        let room_ids = self.clusters.read().await.keys().cloned().collect::<Vec<_>>();
        let mut touched = Vec::new();
        for room_id in room_ids {
            if let Some(cluster) = self.clusters.read().await.get(&room_id) {
                if cluster.worker_ids().await.iter().any(|id| id == worker_id) {
                    touched.push(room_id);
                }
            }
        }

        let futures = touched.into_iter().map(|room_id| {
            let this = Arc::clone(self);
            async move {
                this.close_room(&room_id, "worker_died").await;
            }
        });
        futures::future::join_all(futures).await;
    }

    /// §5 graceful shutdown step (iv): closes every room this instance
    /// still owns, concurrently, logging (not propagating) failures.
    pub async fn close_all(self: &Arc<Self>, reason: &str) {
        let room_ids = self.clusters.read().await.keys().cloned().collect::<Vec<_>>();
        let futures = room_ids.into_iter().map(|room_id| {
            let this = Arc::clone(self);
            let reason = reason.to_string();
            async move {
                this.close_room(&room_id, &reason).await;
            }
        });
        futures::future::join_all(futures).await;
    }

    /// Periodic scan: closes every locally-owned room whose
    /// `lastActivityAtMs` is older than `threshold`.
    pub async fn auto_close_inactive(self: &Arc<Self>, threshold: Duration) {
        let room_ids = self.clusters.read().await.keys().cloned().collect::<Vec<_>>();
        let now = now_ms();
        for room_id in room_ids {
            match self.read_room_state(&room_id).await {
                Ok(Some(state)) => {
                    let age_ms = now - state.last_activity_at_ms;
                    if age_ms >= threshold.as_millis() as i64 {
                        self.close_room(&room_id, "inactive").await;
                    }
                }
                Ok(None) => {
                    // State already gone (closed elsewhere); drop our handle.
                    self.close_room(&room_id, "state_missing").await;
                }
                Err(e) => {
                    error!(self.log, "failed to read room state during auto-close scan";
                        "room_id" => %room_id, "error" => %e);
                }
            }
        }
    }

    async fn conn(&self) -> Result<crate::redis_pool::Connection, InternalError> {
        Ok(self.redis.get().await.map_err(|e| {
            InternalError(failure::format_err!("redis pool checkout failed: {}", e))
        })?)
    }
}
