//! §8 end-to-end scenarios, exercised across the real handler/registry/seat
//! stack against a local Redis — the same `REDIS_URL`-gated, `#[ignore]`
//! convention `seats::repository`/`users::socket_registry`'s own tests use,
//! since nothing here can run without a broker to talk to.
//!
//! `SessionHub`/actix are not involved: a `RecordingBroadcaster` test
//! double stands in for the session layer, the same shape as
//! `relay::tests::RecordingTarget`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use msab::backend::BackendClient;
use msab::clients::ClientRegistry;
use msab::config::LaravelSettings;
use msab::error::AppError;
use msab::gifts::{GiftBuffer, GiftTransaction};
use msab::handlers::{Broadcaster, GiftHandlers, MediaHandlers, RoomHandlers, SeatHandlers};
use msab::handlers::room::JoinRequest;
use msab::handlers::seat::{InviteRequest, RoomOnlyRequest, SeatIndexRequest};
use msab::handlers::gift::SendGiftRequest;
use msab::handlers::media::{ProduceRequest, TransportCreateRequest};
use msab::media::engine::mock::MockEngine;
use msab::media::engine::Worker;
use msab::media::worker_pool::WorkerPool;
use msab::ratelimit::RateLimiter;
use msab::rooms::RoomRegistry;
use msab::seats::SeatRepository;
use msab::users::UserSocketRegistry;

fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

async fn redis_pool() -> deadpool_redis::Pool {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    let mut cfg = deadpool_redis::Config::from_url(url);
    cfg.pool = Some(deadpool_redis::PoolConfig::new(8));
    cfg.create_pool(Some(deadpool_redis::Runtime::Tokio1)).unwrap()
}

#[derive(Default)]
struct RecordingBroadcaster {
    events: Mutex<Vec<(String, String, serde_json::Value)>>,
}

impl RecordingBroadcaster {
    fn events_named(&self, event: &str) -> Vec<(String, serde_json::Value)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, ..)| e == event)
            .map(|(_, target, payload)| (target.clone(), payload.clone()))
            .collect()
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn to_room(
        &self,
        room_id: &str,
        _exclude_connection_id: Option<&str>,
        event: &str,
        payload: serde_json::Value,
    ) {
        self.events
            .lock()
            .unwrap()
            .push((event.to_string(), room_id.to_string(), payload));
    }

    fn to_connection(&self, connection_id: &str, event: &str, payload: serde_json::Value) {
        self.events
            .lock()
            .unwrap()
            .push((event.to_string(), connection_id.to_string(), payload));
    }

    fn to_sockets(&self, socket_ids: &[String], event: &str, payload: serde_json::Value) {
        self.events
            .lock()
            .unwrap()
            .push((event.to_string(), socket_ids.join(","), payload));
    }

    fn is_connected(&self, _connection_id: &str) -> bool {
        true
    }
}

struct Harness {
    registry: Arc<RoomRegistry>,
    clients: Arc<ClientRegistry>,
    sockets: Arc<UserSocketRegistry>,
    seats: Arc<SeatRepository>,
    rate_limiter: Arc<RateLimiter>,
    broadcaster: Arc<RecordingBroadcaster>,
    room: RoomHandlers,
    seat: Arc<SeatHandlers>,
    media: MediaHandlers,
    gift: GiftHandlers,
    gift_buffer: Arc<GiftBuffer>,
}

async fn harness(backend_url: &str, gift_errors: Arc<Mutex<Vec<(String, String, String)>>>) -> Harness {
    let pool = redis_pool().await;
    let log = test_logger();

    let engine = MockEngine::new();
    let workers: Vec<Box<dyn Worker>> = vec![engine.spawn_worker(1), engine.spawn_worker(2)];
    let worker_pool = WorkerPool::new(log.clone(), workers);

    let seats = Arc::new(SeatRepository::new(pool.clone()));
    let sockets = Arc::new(UserSocketRegistry::new(pool.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(pool.clone()));
    let clients = Arc::new(ClientRegistry::new());

    let backend = Arc::new(BackendClient::new(
        &LaravelSettings {
            api_url: backend_url.to_string(),
            timeout: Duration::from_millis(300),
            ..Default::default()
        },
        log.clone(),
    ));

    let registry = RoomRegistry::new(
        Arc::clone(&worker_pool),
        pool.clone(),
        Arc::clone(&seats),
        Arc::clone(&backend),
        3,
        Duration::from_secs(10),
        500,
        15,
        log.clone(),
    );

    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let dyn_broadcaster: Arc<dyn Broadcaster> = Arc::clone(&broadcaster) as Arc<dyn Broadcaster>;

    let gift_buffer = Arc::new(GiftBuffer::new(
        pool.clone(),
        Arc::clone(&backend),
        4,
        100,
        Box::new(move |txn: &GiftTransaction, code: &str, reason: &str| {
            gift_errors.lock().unwrap().push((
                txn.transaction_id.to_string(),
                code.to_string(),
                reason.to_string(),
            ));
        }),
        log.clone(),
    ));

    let room = RoomHandlers::new(
        Arc::clone(&registry),
        Arc::clone(&clients),
        Arc::clone(&sockets),
        Arc::clone(&seats),
        Arc::clone(&backend),
        Arc::clone(&dyn_broadcaster),
        log.clone(),
    );
    let seat = Arc::new(SeatHandlers::new(
        Arc::clone(&seats),
        Arc::clone(&registry),
        Arc::clone(&clients),
        Arc::clone(&sockets),
        Arc::clone(&dyn_broadcaster),
        Duration::from_secs(30),
        log.clone(),
    ));
    let media = MediaHandlers::new(
        Arc::clone(&registry),
        Arc::clone(&clients),
        Arc::clone(&seats),
        Arc::clone(&seat),
        Arc::clone(&dyn_broadcaster),
        log.clone(),
    );
    let gift = GiftHandlers::new(
        Arc::clone(&gift_buffer),
        Arc::clone(&registry),
        Arc::clone(&clients),
        Arc::clone(&sockets),
        Arc::clone(&rate_limiter),
        330,
        Duration::from_secs(60),
        Arc::clone(&dyn_broadcaster),
        log.clone(),
    );

    Harness {
        registry,
        clients,
        sockets,
        seats,
        rate_limiter,
        broadcaster,
        room,
        seat,
        media,
        gift,
        gift_buffer,
    }
}

async fn join(h: &Harness, connection_id: &str, user_id: &str, room_id: &str, seat_count: Option<u32>) {
    h.clients
        .register(connection_id.to_string(), user_id.to_string(), 0)
        .await;
    h.room
        .join(
            connection_id,
            user_id,
            JoinRequest {
                room_id: room_id.to_string(),
                seat_count,
                owner_id: Some(user_id.to_string()),
            },
        )
        .await
        .unwrap();
}

/// §8 S1: a speaker's producer shows up in a later joiner's `existingProducers`.
#[tokio::test]
#[ignore]
async fn s1_speaker_join_and_first_audio() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let h = harness("http://127.0.0.1:1", errors).await;
    let room_id = "it-s1-room";
    h.seats.clear_room(room_id).await.unwrap();

    join(&h, "c-alice", "alice", room_id, Some(15)).await;

    let transport = h
        .media
        .create_transport(
            "c-alice",
            TransportCreateRequest {
                room_id: room_id.to_string(),
                role: "producer".to_string(),
            },
        )
        .await
        .unwrap();

    let produced = h
        .media
        .produce(
            "c-alice",
            ProduceRequest {
                room_id: room_id.to_string(),
                transport_id: transport.id.clone(),
                kind: "audio".to_string(),
                rtp_parameters: serde_json::json!({}),
                app_data: serde_json::json!({}),
            },
        )
        .await
        .unwrap();

    h.clients
        .register("c-bob".to_string(), "bob".to_string(), 0)
        .await;
    let bob_join = h
        .room
        .join(
            "c-bob",
            "bob",
            JoinRequest {
                room_id: room_id.to_string(),
                seat_count: None,
                owner_id: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(bob_join.existing_producers.len(), 1);
    assert_eq!(bob_join.existing_producers[0].producer_id, produced.producer_id);
    assert_eq!(bob_join.existing_producers[0].user_id, "alice");

    let new_producer_events = h.broadcaster.events_named("audio:newProducer");
    assert_eq!(new_producer_events.len(), 1);

    h.seats.clear_room(room_id).await.unwrap();
}

/// §8 S3: locking an occupied seat vacates the occupant and closes their
/// producer server-side.
#[tokio::test]
#[ignore]
async fn s3_seat_lock_kicks_occupant() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let h = harness("http://127.0.0.1:1", errors).await;
    let room_id = "it-s3-room";
    h.seats.clear_room(room_id).await.unwrap();

    join(&h, "c-owner", "owner", room_id, Some(15)).await;
    join(&h, "c-alice", "alice", room_id, None).await;

    h.seat
        .take(
            "c-alice",
            SeatIndexRequest {
                room_id: room_id.to_string(),
                seat_index: 3,
            },
        )
        .await
        .unwrap();

    let transport = h
        .media
        .create_transport(
            "c-alice",
            TransportCreateRequest {
                room_id: room_id.to_string(),
                role: "producer".to_string(),
            },
        )
        .await
        .unwrap();
    h.media
        .produce(
            "c-alice",
            ProduceRequest {
                room_id: room_id.to_string(),
                transport_id: transport.id,
                kind: "audio".to_string(),
                rtp_parameters: serde_json::json!({}),
                app_data: serde_json::json!({}),
            },
        )
        .await
        .unwrap();

    h.seat
        .lock(
            "c-owner",
            SeatIndexRequest {
                room_id: room_id.to_string(),
                seat_index: 3,
            },
        )
        .await
        .unwrap();

    let seats = h.seats.get_seats(room_id, 15).await.unwrap();
    let seat3 = seats.iter().find(|s| s.index == 3).unwrap();
    assert!(seat3.user_id.is_none());
    assert!(seat3.locked);
    assert!(h.clients.producer_ids_of("c-alice").await.is_empty());

    assert_eq!(h.broadcaster.events_named("seat:cleared").len(), 1);
    assert_eq!(h.broadcaster.events_named("seat:locked").len(), 1);

    h.seats.clear_room(room_id).await.unwrap();
}

/// §8 S4: accepting an invite bypasses the seat's own lock.
#[tokio::test]
#[ignore]
async fn s4_invite_accept_bypasses_lock() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let h = harness("http://127.0.0.1:1", errors).await;
    let room_id = "it-s4-room";
    h.seats.clear_room(room_id).await.unwrap();

    join(&h, "c-owner", "owner", room_id, Some(15)).await;
    join(&h, "c-frank", "frank", room_id, None).await;

    h.seat
        .lock(
            "c-owner",
            SeatIndexRequest {
                room_id: room_id.to_string(),
                seat_index: 5,
            },
        )
        .await
        .unwrap();

    h.seat
        .invite(
            "c-owner",
            InviteRequest {
                room_id: room_id.to_string(),
                seat_index: 5,
                target_user_id: "frank".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(h.broadcaster.events_named("seat:invite:received").len(), 1);

    h.seat
        .accept_invite(
            "c-frank",
            RoomOnlyRequest {
                room_id: room_id.to_string(),
            },
        )
        .await
        .unwrap();

    let seats = h.seats.get_seats(room_id, 15).await.unwrap();
    let seat5 = seats.iter().find(|s| s.index == 5).unwrap();
    assert_eq!(seat5.user_id.as_deref(), Some("frank"));
    assert!(!seat5.locked);

    let updated = h.broadcaster.events_named("seat:updated");
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].1["userId"], "frank");

    h.seats.clear_room(room_id).await.unwrap();
}

/// §8 S5: a gift that the business backend never accepts ends up
/// dead-lettered and the sender is told via `gift:error`.
#[tokio::test]
#[ignore]
async fn s5_gift_durability_across_backend_outage() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let h = harness("http://127.0.0.1:1", Arc::clone(&errors)).await;
    let room_id = "it-s5-room";
    h.seats.clear_room(room_id).await.unwrap();

    join(&h, "c-alice", "alice", room_id, Some(15)).await;
    h.clients
        .register("c-bob".to_string(), "bob".to_string(), 0)
        .await;

    h.gift
        .send(
            "c-alice",
            SendGiftRequest {
                room_id: room_id.to_string(),
                recipient_user_id: "bob".to_string(),
                gift_id: "7".to_string(),
                quantity: 1,
            },
        )
        .await
        .unwrap();
    assert_eq!(h.broadcaster.events_named("gift:received").len(), 1);

    // backend is unreachable, so every flush fails and retryCount climbs
    // 1, 2, 3; the fourth failed flush reaches max_retries (4) and
    // dead-letters it.
    for _ in 0..4 {
        h.gift_buffer.flush_once().await.unwrap();
    }

    let recorded = errors.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].1, "PROCESSING_FAILED");

    h.seats.clear_room(room_id).await.unwrap();
}

/// Rate limiting is a per-bucket fixed window: the (limit+1)th call within
/// the window is rejected regardless of how many distinct buckets exist.
#[tokio::test]
#[ignore]
async fn rate_limiter_rejects_once_bucket_is_exhausted() {
    let pool = redis_pool().await;
    let limiter = RateLimiter::new(pool);
    let bucket = "gift:it-ratelimit-alice";

    assert!(limiter.check(bucket, 2, Duration::from_secs(60)).await.unwrap());
    assert!(limiter.check(bucket, 2, Duration::from_secs(60)).await.unwrap());
    assert!(!limiter.check(bucket, 2, Duration::from_secs(60)).await.unwrap());
}

/// Boundary: `seatIndex` outside `[0, seatCount)` is rejected.
#[tokio::test]
#[ignore]
async fn seat_index_out_of_range_is_rejected() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let h = harness("http://127.0.0.1:1", errors).await;
    let room_id = "it-bounds-room";
    h.seats.clear_room(room_id).await.unwrap();
    join(&h, "c-owner", "owner", room_id, Some(15)).await;

    let err = h
        .seat
        .take(
            "c-owner",
            SeatIndexRequest {
                room_id: room_id.to_string(),
                seat_index: 15,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, AppError::SeatOutOfRange);

    h.seats.clear_room(room_id).await.unwrap();
}
