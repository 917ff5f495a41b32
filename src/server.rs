//! HTTP server bootstrap — binds the WS upgrade route, owns the
//! `actix_web::dev::Server` handle the shutdown sequence stops, and wires
//! the relayed-event bridge and the background loops `main.rs` hands to
//! [`crate::shutdown::graceful_shutdown`].
//!
//! Grounded on `mock/control-api/src/api/mod.rs`'s `run()`: build an `App`
//! inside `HttpServer::new(move || ...)`, `.bind(addr)?.run()`. HTTP
//! health/metrics endpoints are an external collaborator per scope, so the
//! only route here is the WS upgrade.

use std::sync::Arc;

use actix_web::dev::Server;
use actix_web::{web, App, HttpServer};
use serde_json::Value;
use slog::{info, Logger};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::handlers::Broadcaster;
use crate::relay::RelayTarget;
use crate::rooms::RoomRegistry;
use crate::session::{ws_route, AppState, SessionHub};
use crate::shutdown::BackgroundTasks;
use crate::users::UserSocketRegistry;

/// Builds and starts the HTTP server, returning its [`Server`] handle
/// (`.stop(true)` on this drives step (i) of the §5 shutdown sequence).
pub fn run(bind_addr: &str, state: Arc<AppState>, log: Logger) -> std::io::Result<Server> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::from(Arc::clone(&state)))
            .route("/ws", web::get().to(ws_route))
    })
    .bind(bind_addr)?
    .run();

    info!(log, "http server listening"; "bind_addr" => bind_addr);
    Ok(server)
}

/// Adapts [`SessionHub`]/[`UserSocketRegistry`] to the `EventRelay`'s
/// `RelayTarget` contract. `send_to_user` needs an async socket lookup, so
/// it's dispatched onto its own task — the same fire-and-forget shape as
/// `Broadcaster`'s own methods.
struct RelayBridge {
    hub: Arc<SessionHub>,
    sockets: Arc<UserSocketRegistry>,
}

impl RelayTarget for RelayBridge {
    fn send_to_user(&self, user_id: &str, event: &str, payload: &Value) {
        let hub = Arc::clone(&self.hub);
        let sockets = Arc::clone(&self.sockets);
        let user_id = user_id.to_string();
        let event = event.to_string();
        let payload = payload.clone();
        actix::spawn(async move {
            if let Ok(ids) = sockets.sockets_for(&user_id).await {
                hub.to_sockets(&ids, &event, payload);
            }
        });
    }

    fn send_to_room(&self, room_id: &str, event: &str, payload: &Value) {
        self.hub.to_room(room_id, None, event, payload.clone());
    }

    fn broadcast(&self, event: &str, payload: &Value) {
        self.hub.broadcast_all(event, payload.clone());
    }
}

/// Spawns the three loops the §5 sequence must drain: the seat auto-close
/// scan, the gift buffer flush loop, and (if enabled) the event relay
/// subscription. Returns the `watch::Sender` that signals all of them and
/// the join handles `graceful_shutdown` awaits.
pub fn spawn_background_tasks(
    settings: &Settings,
    registry: Arc<RoomRegistry>,
    gifts: Arc<crate::gifts::GiftBuffer>,
    hub: Arc<SessionHub>,
    sockets: Arc<UserSocketRegistry>,
    log: Logger,
) -> (watch::Sender<bool>, BackgroundTasks) {
    let (tx, rx) = watch::channel(false);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    let scan_interval = settings.seats.auto_close_scan_interval;
    let inactivity_threshold = settings.seats.inactivity_threshold;
    let scan_registry = Arc::clone(&registry);
    let mut scan_shutdown = rx.clone();
    handles.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(scan_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    scan_registry.auto_close_inactive(inactivity_threshold).await;
                }
                _ = scan_shutdown.changed() => {
                    if *scan_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }));

    let flush_interval = settings.gift.flush_interval;
    let gift_rx = rx.clone();
    handles.push(tokio::spawn(async move {
        gifts.run(flush_interval, gift_rx).await;
    }));

    if settings.relay.enabled {
        let relay = crate::relay::EventRelay::new(
            settings.redis.url(),
            settings.relay.channel.clone(),
            RelayBridge { hub, sockets },
            settings.relay.in_flight_warn_threshold,
            log,
        );
        let relay_rx = rx.clone();
        handles.push(tokio::spawn(async move {
            relay.run(relay_rx).await;
        }));
    }

    (tx, BackgroundTasks { handles })
}
