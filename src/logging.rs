//! Structured logging, installed as the process-wide logger.
//!
//! Follows the same `slog` + `slog-envlogger` + `slog-async` pipeline used
//! in `mock/control-api/src/lib.rs`, but emits JSON by default (this is a
//! service, not a terminal tool) with a `term` fallback for local dev.

use slog::{o, Drain};
use slog_scope::GlobalLoggerGuard;

/// Installs the global [`slog`] logger and bridges the standard `log` facade
/// onto it, so dependencies that log via `log::info!` etc. are captured too.
///
/// # Panics
///
/// Panics if [`slog_stdlog::init`] has already been called by something
/// else in this process.
#[must_use]
pub fn init(service: &'static str, json: bool) -> GlobalLoggerGuard {
    let drain = if json {
        let drain = slog_json::Json::default(std::io::stdout()).fuse();
        let drain = slog_envlogger::new(drain).fuse();
        slog_async::Async::new(drain).build().fuse()
    } else {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_envlogger::new(drain).fuse();
        slog_async::Async::new(drain).build().fuse()
    };

    let logger = slog::Logger::root(drain, o!("service" => service));
    let guard = slog_scope::set_global_logger(logger);
    slog_stdlog::init().expect("slog_stdlog::init must only run once");

    guard
}
