//! Control plane for the audio-only conferencing service (§1).
//!
//! The realtime coordination core — media routing/fan-out, active-speaker
//! detection, seat state, the user→socket registry and event relay, and
//! the gift transaction buffer — is implemented across the modules below;
//! `session`/`server`/`shutdown` are the actix wiring around it.

#![forbid(unsafe_code)]

pub mod auth;
pub mod backend;
pub mod clients;
pub mod config;
pub mod error;
pub mod gifts;
pub mod handlers;
pub mod logging;
pub mod media;
pub mod ratelimit;
pub mod redis_keys;
pub mod redis_pool;
pub mod relay;
pub mod rooms;
pub mod seats;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod users;
