//! Binary entry point: loads configuration, wires every collaborator, and
//! runs the actix-web server until a shutdown signal drives the §5
//! sequence in [`msab::shutdown`].
//!
//! Grounded on `mock/control-api/src/main.rs`'s bootstrap shape (`dotenv`,
//! logger init, then start the server and run it) with the teacher's
//! `actix::System::new(...).run()` replaced by `#[actix_web::main]`.

use std::sync::Arc;
use std::time::Duration;

use msab::auth::{OriginGate, TokenVerifier};
use msab::backend::BackendClient;
use msab::clients::ClientRegistry;
use msab::config::Settings;
use msab::gifts::{GiftBuffer, GiftTransaction, OnGiftError};
use msab::handlers::{Broadcaster, GiftHandlers, MediaHandlers, RoomHandlers, SeatHandlers};
use msab::media::engine::mock::MockEngine;
use msab::media::engine::Worker;
use msab::media::worker_pool::WorkerPool;
use msab::ratelimit::RateLimiter;
use msab::rooms::RoomRegistry;
use msab::session::{AppState, Handlers, SessionHub};
use msab::users::UserSocketRegistry;
use msab::{logging, redis_pool, server, shutdown};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let settings = Settings::load().expect("failed to load configuration");
    let json_logs = std::env::var("LOG_FORMAT").map_or(true, |v| v != "pretty");
    let _log_guard = logging::init("msab", json_logs);
    let log = slog_scope::logger();

    let redis_pool = redis_pool::build(&settings.redis).expect("failed to build redis pool");

    let backend = Arc::new(BackendClient::new(&settings.laravel, log.clone()));
    let seats = Arc::new(msab::seats::SeatRepository::new(redis_pool.clone()));
    let sockets = Arc::new(UserSocketRegistry::new(redis_pool.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(redis_pool.clone()));
    let clients = Arc::new(ClientRegistry::new());
    let hub = SessionHub::new();

    let token_verifier = Arc::new(TokenVerifier::new(&settings.jwt, redis_pool.clone()));
    let origin_gate = Arc::new(OriginGate::new(&settings.cors));

    // No production media-engine binding ships with this crate (§1 scope:
    // only the abstract contract is specified) — the mock engine stands
    // in until a real worker process binding is plugged in.
    let engine = MockEngine::new();
    let worker_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let workers: Vec<Box<dyn Worker>> = (0..worker_count)
        .map(|i| engine.spawn_worker(i as u32))
        .collect();
    let worker_pool = WorkerPool::new(log.clone(), workers);

    let registry = RoomRegistry::new(
        Arc::clone(&worker_pool),
        redis_pool.clone(),
        Arc::clone(&seats),
        Arc::clone(&backend),
        settings.media.max_active_speakers_forwarded,
        settings.media.active_speaker_window,
        settings.media.max_listeners_per_distribution_router,
        settings.seats.default_count,
        log.clone(),
    );

    {
        let registry = Arc::clone(&registry);
        worker_pool
            .on_worker_died(Box::new(move |worker_id: &str| {
                let registry = Arc::clone(&registry);
                let worker_id = worker_id.to_string();
                tokio::spawn(async move {
                    registry.handle_worker_died(&worker_id).await;
                });
            }))
            .await;
    }
    {
        let hub = Arc::clone(&hub);
        registry
            .on_room_closed(Box::new(move |room_id: &str, reason: &str| {
                hub.to_room(
                    room_id,
                    None,
                    "room:closed",
                    serde_json::json!({ "reason": reason }),
                );
            }))
            .await;
    }

    let gift_on_error: OnGiftError = {
        let hub = Arc::clone(&hub);
        let sockets = Arc::clone(&sockets);
        Box::new(move |txn: &GiftTransaction, code: &str, reason: &str| {
            let hub = Arc::clone(&hub);
            let sockets = Arc::clone(&sockets);
            let sender_user_id = txn.sender_user_id.clone();
            let payload = serde_json::json!({
                "transactionId": txn.transaction_id,
                "code": code,
                "reason": reason,
            });
            actix::spawn(async move {
                if let Ok(ids) = sockets.sockets_for(&sender_user_id).await {
                    hub.to_sockets(&ids, "gift:error", payload);
                }
            });
        })
    };
    let gifts = Arc::new(GiftBuffer::new(
        redis_pool.clone(),
        Arc::clone(&backend),
        settings.gift.max_retries,
        settings.gift.dead_letter_cap,
        gift_on_error,
        log.clone(),
    ));

    let broadcaster: Arc<dyn Broadcaster> = Arc::clone(&hub) as Arc<dyn Broadcaster>;

    let room_handlers = Arc::new(RoomHandlers::new(
        Arc::clone(&registry),
        Arc::clone(&clients),
        Arc::clone(&sockets),
        Arc::clone(&seats),
        Arc::clone(&backend),
        Arc::clone(&broadcaster),
        log.clone(),
    ));
    let seat_handlers = Arc::new(SeatHandlers::new(
        Arc::clone(&seats),
        Arc::clone(&registry),
        Arc::clone(&clients),
        Arc::clone(&sockets),
        Arc::clone(&broadcaster),
        Duration::from_secs(settings.seats.invite_expiry_seconds),
        log.clone(),
    ));
    let media_handlers = Arc::new(MediaHandlers::new(
        Arc::clone(&registry),
        Arc::clone(&clients),
        Arc::clone(&seats),
        Arc::clone(&seat_handlers),
        Arc::clone(&broadcaster),
        log.clone(),
    ));
    let gift_handlers = Arc::new(GiftHandlers::new(
        Arc::clone(&gifts),
        Arc::clone(&registry),
        Arc::clone(&clients),
        Arc::clone(&sockets),
        Arc::clone(&rate_limiter),
        settings.gift.rate_limit_events,
        settings.gift.rate_limit_window,
        Arc::clone(&broadcaster),
        log.clone(),
    ));

    let handlers = Arc::new(Handlers {
        room: room_handlers,
        seat: seat_handlers,
        media: media_handlers,
        gift: gift_handlers,
    });

    let app_state = Arc::new(AppState {
        token_verifier,
        origin_gate,
        clients: Arc::clone(&clients),
        sockets: Arc::clone(&sockets),
        hub: Arc::clone(&hub),
        handlers,
        log: log.clone(),
    });

    let srv = server::run(&settings.bind_addr, app_state, log.clone())?;

    let (shutdown_tx, background) = server::spawn_background_tasks(
        &settings,
        Arc::clone(&registry),
        Arc::clone(&gifts),
        Arc::clone(&hub),
        Arc::clone(&sockets),
        log.clone(),
    );

    let srv_for_shutdown = srv.clone();
    let shutdown_registry = Arc::clone(&registry);
    let shutdown_log = log.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown::graceful_shutdown(
            srv_for_shutdown,
            shutdown_tx,
            background,
            shutdown_registry,
            shutdown_log,
        )
        .await;
    });

    srv.await
}
