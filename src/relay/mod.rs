//! §4.8 `EventRelay` — delivers business-backend-originated events to the
//! sockets they target.
//!
//! No metrics crate travels with this stack, so the in-flight
//! gauge/duration/received counters §4.8 calls for are kept as in-process
//! atomics and surfaced through structured log lines rather than a
//! Prometheus-style exporter — consistent with the rest of this crate's
//! ambient observability.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use slog::{debug, error, o, warn, Logger};
use tokio::sync::Mutex;

/// Event names this instance will actually deliver. Unknown names are
/// rejected rather than silently forwarded — an explicit opt-in per event.
const ALLOWED_EVENTS: &[&str] = &[
    "user:balance_updated",
    "user:banned",
    "room:force_closed",
    "system:announcement",
];

#[derive(Debug, Deserialize)]
struct RawEvent {
    event: String,
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    room_id: Option<i64>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    correlation_id: String,
}

/// Abstracts over the session layer so this module doesn't need to know
/// about actix actors or socket transports.
pub trait RelayTarget: Send + Sync {
    fn send_to_user(&self, user_id: &str, event: &str, payload: &Value);
    fn send_to_room(&self, room_id: &str, event: &str, payload: &Value);
    fn broadcast(&self, event: &str, payload: &Value);
}

#[derive(Default)]
pub struct RelayMetrics {
    in_flight: AtomicU64,
    received: Mutex<HashMap<(String, &'static str), u64>>,
}

impl RelayMetrics {
    async fn record(&self, event: &str, delivered: &'static str) {
        let mut received = self.received.lock().await;
        *received.entry((event.to_string(), delivered)).or_insert(0) += 1;
    }

    pub async fn received_count(&self, event: &str, delivered: &str) -> u64 {
        self.received
            .lock()
            .await
            .iter()
            .find(|((e, d), _)| e == event && *d == delivered)
            .map_or(0, |(_, count)| *count)
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

pub struct EventRelay<T: RelayTarget> {
    redis_url: String,
    channel: String,
    target: T,
    metrics: RelayMetrics,
    in_flight_warn_threshold: u64,
    log: Logger,
}

impl<T: RelayTarget> EventRelay<T> {
    #[must_use]
    pub fn new(
        redis_url: String,
        channel: String,
        target: T,
        in_flight_warn_threshold: u64,
        log: Logger,
    ) -> Self {
        Self {
            redis_url,
            channel,
            target,
            metrics: RelayMetrics::default(),
            in_flight_warn_threshold,
            log: log.new(o!("component" => "event_relay")),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Runs the subscription loop until the connection drops or
    /// `shutdown` fires. Reconnection/backoff is the caller's
    /// responsibility (mirrors how `GiftBuffer::run` is driven).
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let client = match redis::Client::open(self.redis_url.as_str()) {
            Ok(c) => c,
            Err(e) => {
                error!(self.log, "failed to build redis client for relay"; "error" => %e);
                return;
            }
        };
        let conn = match client.get_async_connection().await {
            Ok(c) => c,
            Err(e) => {
                error!(self.log, "failed to connect for relay subscription"; "error" => %e);
                return;
            }
        };
        let mut pubsub = conn.into_pubsub();
        if let Err(e) = pubsub.subscribe(&self.channel).await {
            error!(self.log, "failed to subscribe to relay channel"; "error" => %e);
            return;
        }
        let mut stream = pubsub.on_message();

        loop {
            tokio::select! {
                msg = stream.next() => {
                    match msg {
                        Some(msg) => {
                            let payload: String = match msg.get_payload() {
                                Ok(p) => p,
                                Err(e) => {
                                    warn!(self.log, "relay message payload decode failed"; "error" => %e);
                                    continue;
                                }
                            };
                            self.handle_message(&payload).await;
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn handle_message(&self, raw: &str) {
        self.metrics.in_flight.fetch_add(1, Ordering::Relaxed);
        let in_flight = self.metrics.in_flight();
        if in_flight > self.in_flight_warn_threshold {
            warn!(self.log, "event relay in-flight gauge above threshold";
                "in_flight" => in_flight);
        }
        let start = Instant::now();

        let delivered = self.dispatch(raw).await;

        let elapsed_ms = start.elapsed().as_millis();
        debug!(self.log, "relay event processed"; "elapsed_ms" => elapsed_ms as u64);
        self.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);

        if let Some(event_name) = delivered {
            self.metrics.record(&event_name, "true").await;
        }
    }

    /// Returns `Some(event_name)` if delivery was attempted (for the
    /// counter), regardless of whether a send ultimately reached a socket.
    async fn dispatch(&self, raw: &str) -> Option<String> {
        let parsed: RawEvent = match serde_json::from_str(raw) {
            Ok(e) => e,
            Err(e) => {
                warn!(self.log, "relay event failed schema validation"; "error" => %e);
                self.metrics.record("unknown", "error").await;
                return None;
            }
        };

        if !ALLOWED_EVENTS.contains(&parsed.event.as_str()) {
            warn!(self.log, "relay event not on allowlist"; "event" => %parsed.event);
            self.metrics.record(&parsed.event, "rejected").await;
            return None;
        }

        match (parsed.user_id, parsed.room_id) {
            (Some(user_id), _) => {
                self.target
                    .send_to_user(&user_id.to_string(), &parsed.event, &parsed.payload);
            }
            (None, Some(room_id)) => {
                self.target
                    .send_to_room(&room_id.to_string(), &parsed.event, &parsed.payload);
            }
            (None, None) => {
                self.target.broadcast(&parsed.event, &parsed.payload);
            }
        }

        Some(parsed.event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingTarget {
        calls: StdMutex<Vec<String>>,
    }

    impl RelayTarget for RecordingTarget {
        fn send_to_user(&self, user_id: &str, event: &str, _payload: &Value) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("user:{}:{}", user_id, event));
        }
        fn send_to_room(&self, room_id: &str, event: &str, _payload: &Value) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("room:{}:{}", room_id, event));
        }
        fn broadcast(&self, event: &str, _payload: &Value) {
            self.calls.lock().unwrap().push(format!("broadcast:{}", event));
        }
    }

    fn test_logger() -> Logger {
        slog::Logger::root(slog::Discard, o!())
    }

    fn relay() -> EventRelay<RecordingTarget> {
        EventRelay::new(
            "redis://127.0.0.1/".to_string(),
            "test-channel".to_string(),
            RecordingTarget::default(),
            1000,
            test_logger(),
        )
    }

    #[tokio::test]
    async fn routes_to_user_when_user_id_present() {
        let relay = relay();
        relay
            .dispatch(r#"{"event":"user:balance_updated","user_id":42,"room_id":null,"payload":{},"timestamp":"t","correlation_id":"c"}"#)
            .await;
        assert_eq!(
            relay.target.calls.lock().unwrap().as_slice(),
            ["user:42:user:balance_updated"]
        );
    }

    #[tokio::test]
    async fn routes_to_room_when_only_room_id_present() {
        let relay = relay();
        relay
            .dispatch(r#"{"event":"room:force_closed","user_id":null,"room_id":7,"payload":{},"timestamp":"t","correlation_id":"c"}"#)
            .await;
        assert_eq!(
            relay.target.calls.lock().unwrap().as_slice(),
            ["room:7:room:force_closed"]
        );
    }

    #[tokio::test]
    async fn broadcasts_when_neither_id_present() {
        let relay = relay();
        relay
            .dispatch(r#"{"event":"system:announcement","payload":{},"timestamp":"t","correlation_id":"c"}"#)
            .await;
        assert_eq!(
            relay.target.calls.lock().unwrap().as_slice(),
            ["broadcast:system:announcement"]
        );
    }

    #[tokio::test]
    async fn rejects_event_not_on_allowlist() {
        let relay = relay();
        let delivered = relay
            .dispatch(r#"{"event":"totally:unknown","payload":{},"timestamp":"t","correlation_id":"c"}"#)
            .await;
        assert!(delivered.is_none());
        assert!(relay.target.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn drops_events_that_fail_schema_validation() {
        let relay = relay();
        let delivered = relay.dispatch("not json").await;
        assert!(delivered.is_none());
    }
}
