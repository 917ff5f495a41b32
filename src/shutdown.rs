//! §5 graceful shutdown — the five-step sequence, driven by a
//! `tokio::sync::watch` broadcast the way `GiftBuffer::run`/`EventRelay::run`
//! already expect to be signalled, with an overall deadline after which the
//! process exits regardless of what's still draining.
//!
//! Grounded on the teacher's `actix::System::new(...).run()` lifecycle in
//! `mock/control-api/src/main.rs`: here the `System` is replaced by
//! `#[actix_web::main]`, and `tokio::signal::ctrl_c` plus this module stand
//! in for the teacher's (nonexistent) shutdown hook.

use std::time::Duration;

use actix_web::dev::Server;
use slog::{info, warn, Logger};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::rooms::RoomRegistry;
use std::sync::Arc;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Background loops that must observe the shutdown signal and drain before
/// the process exits — the gift buffer flush loop and the event relay
/// subscription loop, at minimum. The auto-close scan loop is included the
/// same way since it shares the signal.
pub struct BackgroundTasks {
    pub handles: Vec<JoinHandle<()>>,
}

/// Runs the §5 sequence once triggered (by Ctrl-C or SIGTERM in `main.rs`).
///
/// # Panics
///
/// Never panics; every step is best-effort and logged, since a stuck
/// collaborator must never prevent the deadline from firing.
pub async fn graceful_shutdown(
    server: Server,
    shutdown_tx: watch::Sender<bool>,
    background: BackgroundTasks,
    registry: Arc<RoomRegistry>,
    log: Logger,
) {
    info!(log, "graceful shutdown starting");

    let sequence = async {
        // (i) stop accepting new connections.
        server.stop(true).await;
        info!(log, "stopped accepting new connections");

        // (ii) stop the auto-close and gift-flush loops; each loop does its
        // own final flush before returning (gift buffer) or simply exits
        // (auto-close scan, event relay).
        let _ = shutdown_tx.send(true);
        for handle in background.handles {
            if let Err(e) = handle.await {
                warn!(log, "background task join failed during shutdown"; "error" => %e);
            }
        }
        info!(log, "background loops drained");

        // (iv) close all media-engine workers (routers/transports/producers
        // per room — process-level worker lifecycle is outside this
        // crate's abstract engine contract).
        registry.close_all("shutdown").await;
        info!(log, "media clusters closed");

        // (v) Redis pools and the relay's pub/sub connection are dropped
        // here as this future completes, closing them implicitly.
    };

    match tokio::time::timeout(SHUTDOWN_DEADLINE, sequence).await {
        Ok(()) => info!(log, "graceful shutdown completed"),
        Err(_) => {
            warn!(log, "graceful shutdown deadline exceeded, forcing exit";
                "deadline_secs" => SHUTDOWN_DEADLINE.as_secs());
            std::process::exit(1);
        }
    }
}
