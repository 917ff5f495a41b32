//! §4.6/§6 — the per-connection actix WS session actor, its wire envelope,
//! and the [`SessionHub`] that implements [`Broadcaster`] over it.
//!
//! Grounded on `mock/control-api/src/api/ws.rs`'s `WsSession`/`Notification`/
//! `Subscribers` trio: one actor per socket, a `Recipient<Notification>`
//! registered at `started()` and dropped at `stopped()`, broadcast fan-out
//! done by looking the recipients up through a shared map rather than
//! threading every session's address through the handler layer.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use actix::{Actor, ActorContext, Addr, AsyncContext, Handler, Message, Recipient, StreamHandler};
use actix_web::{web, Error as ActixError, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use slog::{debug, o, warn, Logger};
use uuid::Uuid;

use crate::auth::{OriginGate, TokenVerifier};
use crate::clients::ClientRegistry;
use crate::error::{AppError, AppResult, Ack};
use crate::handlers::room::LeaveRequest;
use crate::handlers::{Broadcaster, GiftHandlers, MediaHandlers, RoomHandlers, SeatHandlers};
use crate::users::UserSocketRegistry;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// The four handler families a session dispatches to, bundled so the actor
/// itself only needs one field rather than one per family (the "god
/// context" note in §9 is about handler construction, not this bundling —
/// each family is still built with its own narrow collaborator set).
pub struct Handlers {
    pub room: Arc<RoomHandlers>,
    pub seat: Arc<SeatHandlers>,
    pub media: Arc<MediaHandlers>,
    pub gift: Arc<GiftHandlers>,
}

/// Shared state the WS route handler needs at handshake time and every
/// session needs for its lifetime.
pub struct AppState {
    pub token_verifier: Arc<TokenVerifier>,
    pub origin_gate: Arc<OriginGate>,
    pub clients: Arc<ClientRegistry>,
    pub sockets: Arc<UserSocketRegistry>,
    pub hub: Arc<SessionHub>,
    pub handlers: Arc<Handlers>,
    pub log: Logger,
}

/// A message pushed to the client, serialized as `{"event", "data"}`.
#[derive(Clone, Debug, Message)]
#[rtype(result = "()")]
pub struct Notification {
    pub event: String,
    pub payload: Value,
}

/// A pre-serialized frame, used to bridge the async dispatch task back onto
/// the actor so only the actor ever touches `ctx.text`.
#[derive(Message)]
#[rtype(result = "()")]
struct Frame(String);

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(rename = "requestId", default)]
    request_id: Option<String>,
    #[serde(default)]
    data: Value,
}

/// Room-and-connection fan-out table, keyed the way the teacher's
/// `Subscribers` is: a plain `std::sync::Mutex`, because registration and
/// broadcast both happen from actix's synchronous actor callbacks.
pub struct SessionHub {
    connections: Mutex<HashMap<String, Recipient<Notification>>>,
    rooms: Mutex<HashMap<String, HashSet<String>>>,
}

impl SessionHub {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            rooms: Mutex::new(HashMap::new()),
        })
    }

    fn register(&self, connection_id: String, recipient: Recipient<Notification>) {
        self.connections.lock().unwrap().insert(connection_id, recipient);
    }

    fn unregister(&self, connection_id: &str) {
        self.connections.lock().unwrap().remove(connection_id);
        for members in self.rooms.lock().unwrap().values_mut() {
            members.remove(connection_id);
        }
    }

    fn join_room(&self, connection_id: &str, room_id: &str) {
        let mut rooms = self.rooms.lock().unwrap();
        for members in rooms.values_mut() {
            members.remove(connection_id);
        }
        rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    fn leave_room(&self, connection_id: &str) {
        for members in self.rooms.lock().unwrap().values_mut() {
            members.remove(connection_id);
        }
    }
}

impl Broadcaster for SessionHub {
    fn to_room(&self, room_id: &str, exclude_connection_id: Option<&str>, event: &str, payload: Value) {
        let members: Vec<String> = {
            let rooms = self.rooms.lock().unwrap();
            rooms
                .get(room_id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };
        let connections = self.connections.lock().unwrap();
        for id in members {
            if Some(id.as_str()) == exclude_connection_id {
                continue;
            }
            if let Some(recipient) = connections.get(&id) {
                let _ = recipient.do_send(Notification {
                    event: event.to_string(),
                    payload: payload.clone(),
                });
            }
        }
    }

    fn to_connection(&self, connection_id: &str, event: &str, payload: Value) {
        if let Some(recipient) = self.connections.lock().unwrap().get(connection_id) {
            let _ = recipient.do_send(Notification {
                event: event.to_string(),
                payload,
            });
        }
    }

    fn to_sockets(&self, socket_ids: &[String], event: &str, payload: Value) {
        let connections = self.connections.lock().unwrap();
        for id in socket_ids {
            if let Some(recipient) = connections.get(id) {
                let _ = recipient.do_send(Notification {
                    event: event.to_string(),
                    payload: payload.clone(),
                });
            }
        }
    }

    fn is_connected(&self, connection_id: &str) -> bool {
        self.connections.lock().unwrap().contains_key(connection_id)
    }
}

impl SessionHub {
    /// Fleet-wide broadcast for relayed events with neither a `user_id`
    /// nor a `room_id` — every connection this instance currently holds.
    pub fn broadcast_all(&self, event: &str, payload: Value) {
        let connections = self.connections.lock().unwrap();
        for recipient in connections.values() {
            let _ = recipient.do_send(Notification {
                event: event.to_string(),
                payload: payload.clone(),
            });
        }
    }
}

fn decode<T: DeserializeOwned>(data: Value) -> AppResult<T> {
    serde_json::from_value(data).map_err(|_| AppError::InvalidPayload)
}

/// Routes one decoded envelope to its handler and serializes the handler's
/// success value to [`Value`] so every match arm unifies on the same
/// `Result<Value, AppError>` regardless of the handler's actual return type.
async fn dispatch(
    handlers: &Handlers,
    hub: &SessionHub,
    connection_id: &str,
    user_id: &str,
    event: &str,
    data: Value,
) -> AppResult<Value> {
    macro_rules! run {
        ($fut:expr) => {
            $fut.await.map(|v| serde_json::to_value(v).unwrap_or(Value::Null))
        };
    }

    match event {
        "room:join" => {
            let req: crate::handlers::room::JoinRequest = decode(data)?;
            let room_id = req.room_id.clone();
            let result = run!(handlers.room.join(connection_id, user_id, req));
            if result.is_ok() {
                hub.sync_room(connection_id, Some(&room_id));
            }
            result
        }
        "room:leave" => {
            let req = decode(data)?;
            let result = run!(handlers.room.leave(connection_id, req));
            if result.is_ok() {
                hub.sync_room(connection_id, None);
            }
            result
        }
        "seat:take" => {
            let req = decode(data)?;
            run!(handlers.seat.take(connection_id, req))
        }
        "seat:leave" => {
            let req = decode(data)?;
            run!(handlers.seat.leave(connection_id, req))
        }
        "seat:assign" => {
            let req = decode(data)?;
            run!(handlers.seat.assign(connection_id, req))
        }
        "seat:remove" => {
            let req = decode(data)?;
            run!(handlers.seat.remove(connection_id, req))
        }
        "seat:mute" => {
            let req = decode(data)?;
            run!(handlers.seat.set_mute(connection_id, req))
        }
        "seat:lock" => {
            let req = decode(data)?;
            run!(handlers.seat.lock(connection_id, req))
        }
        "seat:unlock" => {
            let req = decode(data)?;
            run!(handlers.seat.unlock(connection_id, req))
        }
        "seat:invite" => {
            let req = decode(data)?;
            run!(handlers.seat.invite(connection_id, req))
        }
        "seat:invite:accept" => {
            let req = decode(data)?;
            run!(handlers.seat.accept_invite(connection_id, req))
        }
        "seat:invite:decline" => {
            let req = decode(data)?;
            run!(handlers.seat.decline_invite(connection_id, req))
        }
        "transport:create" => {
            let req = decode(data)?;
            run!(handlers.media.create_transport(connection_id, req))
        }
        "transport:connect" => {
            let req = decode(data)?;
            run!(handlers.media.connect_transport(connection_id, req))
        }
        "audio:produce" => {
            let req = decode(data)?;
            run!(handlers.media.produce(connection_id, req))
        }
        "audio:consume" => {
            let req = decode(data)?;
            run!(handlers.media.consume(connection_id, req))
        }
        "consumer:resume" => {
            let req = decode(data)?;
            run!(handlers.media.resume_consumer(connection_id, req))
        }
        "audio:selfMute" => {
            let req = decode(data)?;
            run!(handlers.media.self_mute(connection_id, req))
        }
        "audio:selfUnmute" => {
            let req = decode(data)?;
            run!(handlers.media.self_unmute(connection_id, req))
        }
        "gift:send" => {
            let req = decode(data)?;
            run!(handlers.gift.send(connection_id, req))
        }
        "gift:prepare" => {
            let req = decode(data)?;
            run!(handlers.gift.prepare(connection_id, req))
        }
        _ => Err(AppError::InvalidPayload),
    }
}

/// Best-effort teardown run when a socket disconnects without sending
/// `room:leave` itself — mirrors what `room:leave` does, minus the ack.
async fn cleanup(
    handlers: Arc<Handlers>,
    clients: Arc<ClientRegistry>,
    sockets: Arc<UserSocketRegistry>,
    connection_id: String,
    user_id: String,
    log: Logger,
) {
    if let Some(room_id) = clients.room_id_of(&connection_id).await {
        if let Err(e) = handlers.room.leave(&connection_id, LeaveRequest { room_id }).await {
            warn!(log, "room:leave cleanup failed on disconnect";
                "connection_id" => &connection_id, "error" => ?e);
        }
    }
    clients.remove(&connection_id).await;
    if let Err(e) = sockets.unregister_socket(&user_id, &connection_id).await {
        warn!(log, "failed to unregister socket on disconnect";
            "connection_id" => &connection_id, "error" => %e);
    }
}

pub struct Session {
    connection_id: String,
    user_id: String,
    hub: Arc<SessionHub>,
    clients: Arc<ClientRegistry>,
    sockets: Arc<UserSocketRegistry>,
    handlers: Arc<Handlers>,
    last_heartbeat: Instant,
    log: Logger,
}

impl Actor for Session {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.hub.register(self.connection_id.clone(), ctx.address().recipient());
        ctx.run_interval(HEARTBEAT_INTERVAL, |session, ctx| {
            if Instant::now().duration_since(session.last_heartbeat) > CLIENT_TIMEOUT {
                debug!(session.log, "client heartbeat timed out"; "connection_id" => &session.connection_id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.hub.unregister(&self.connection_id);
        self.hub.leave_room(&self.connection_id);
        actix::spawn(cleanup(
            Arc::clone(&self.handlers),
            Arc::clone(&self.clients),
            Arc::clone(&self.sockets),
            self.connection_id.clone(),
            self.user_id.clone(),
            self.log.clone(),
        ));
    }
}

impl Handler<Notification> for Session {
    type Result = ();

    fn handle(&mut self, msg: Notification, ctx: &mut Self::Context) {
        let frame = serde_json::json!({ "event": msg.event, "data": msg.payload });
        ctx.text(frame.to_string());
    }
}

impl Handler<Frame> for Session {
    type Result = ();

    fn handle(&mut self, msg: Frame, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for Session {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(_) => {
                ctx.stop();
                return;
            }
        };

        match msg {
            ws::Message::Ping(bytes) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&bytes);
            }
            ws::Message::Pong(_) => {
                self.last_heartbeat = Instant::now();
            }
            ws::Message::Close(reason) => {
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Text(text) => {
                self.last_heartbeat = Instant::now();
                let envelope: Envelope = match serde_json::from_str(&text) {
                    Ok(e) => e,
                    Err(_) => {
                        let ack: Ack<()> = Ack::err(AppError::InvalidPayload);
                        ctx.text(serde_json::to_string(&ack).unwrap_or_default());
                        return;
                    }
                };

                let handlers = Arc::clone(&self.handlers);
                let hub = Arc::clone(&self.hub);
                let connection_id = self.connection_id.clone();
                let user_id = self.user_id.clone();
                let addr = ctx.address();

                actix::spawn(async move {
                    let result = dispatch(&handlers, &hub, &connection_id, &user_id, &envelope.event, envelope.data).await;
                    let ack = Ack::from_result(result);
                    let body = serde_json::json!({
                        "requestId": envelope.request_id,
                        "event": envelope.event,
                        "ack": ack,
                    });
                    let _ = addr.do_send(Frame(body.to_string()));
                });
            }
            ws::Message::Binary(_) | ws::Message::Continuation(_) | ws::Message::Nop => {}
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HandshakeQuery {
    pub token: String,
}

/// §6 handshake: origin check, then token verification, then connection
/// registration — all before the upgrade, so a rejected handshake never
/// spins up an actor at all.
pub async fn ws_route(
    request: HttpRequest,
    query: web::Query<HandshakeQuery>,
    state: web::Data<AppState>,
    stream: web::Payload,
) -> Result<HttpResponse, ActixError> {
    let origin = request
        .headers()
        .get("origin")
        .and_then(|v| v.to_str().ok());
    if let Err(e) = state.origin_gate.check(origin) {
        return Ok(HttpResponse::Forbidden().json(Ack::<()>::err(e)));
    }

    let identity = match state.token_verifier.verify(&query.token).await {
        Ok(identity) => identity,
        Err(e) => return Ok(HttpResponse::Unauthorized().json(Ack::<()>::err(e))),
    };

    let connection_id = Uuid::new_v4().to_string();
    state
        .clients
        .register(connection_id.clone(), identity.user_id.clone(), chrono::Utc::now().timestamp_millis())
        .await;
    if let Err(e) = state.sockets.register_socket(&identity.user_id, &connection_id).await {
        warn!(state.log, "failed to register socket at handshake";
            "connection_id" => &connection_id, "error" => %e);
    }

    let session = Session {
        connection_id,
        user_id: identity.user_id,
        hub: Arc::clone(&state.hub),
        clients: Arc::clone(&state.clients),
        sockets: Arc::clone(&state.sockets),
        handlers: Arc::clone(&state.handlers),
        last_heartbeat: Instant::now(),
        log: state.log.new(o!("component" => "session")),
    };

    ws::start(session, &request, stream)
}

/// Wires `room:join`/`seat:take`/etc.'s room-membership side effects into
/// the hub's fan-out table. Handlers only know about [`Broadcaster`]; the
/// session layer is the one place that also knows which connections belong
/// to which room, so it keeps [`SessionHub`]'s index in sync out-of-band
/// via [`ClientRegistry`]'s own bookkeeping rather than duplicating it.
impl SessionHub {
    /// Called by the handler dispatch loop after a successful `room:join`,
    /// and by `RoomRegistry::close_room`'s `on_closed` hook equivalent on
    /// `room:leave`/disconnect, to keep the fan-out index aligned with
    /// [`ClientRegistry`]'s membership.
    pub fn sync_room(&self, connection_id: &str, room_id: Option<&str>) {
        match room_id {
            Some(room_id) => self.join_room(connection_id, room_id),
            None => self.leave_room(connection_id),
        }
    }
}
