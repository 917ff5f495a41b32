//! Shared `deadpool-redis` pool construction.
//!
//! Every Redis-backed component (`seats`, `users`, `gifts`, `ratelimit`,
//! `auth`) borrows connections from one pool built here rather than opening
//! its own client, so pool sizing and the connection URL stay in one place.

use deadpool_redis::{Config, Runtime};

use crate::config::RedisSettings;

pub type Pool = deadpool_redis::Pool;
pub type Connection = deadpool_redis::Connection;

/// Builds the pool. Does not eagerly connect — the first checkout is where
/// a misconfigured host surfaces, which is why startup explicitly pings
/// once (see `main.rs`) instead of relying on this to fail fast.
pub fn build(settings: &RedisSettings) -> Result<Pool, deadpool_redis::CreatePoolError> {
    let mut cfg = Config::from_url(settings.url());
    cfg.pool = Some(deadpool_redis::PoolConfig::new(settings.pool_size));
    cfg.create_pool(Some(Runtime::Tokio1))
}
