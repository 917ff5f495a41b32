//! Token-bucket-ish rate limiting for client-triggered events (§4.6
//! `gift:send`, default 330 events/60s per sender).
//!
//! Implemented as a fixed-window counter rather than a true token bucket —
//! `INCR` plus a `EXPIRE ... NX` on first increment, exactly the
//! `ratelimit:{bucket}` layout §6 calls out.

use redis::Script;

use crate::error::InternalError;
use crate::redis_keys;
use crate::redis_pool::Pool;

const CHECK_AND_INCREMENT: &str = r#"
local count = redis.call("INCR", KEYS[1])
if count == 1 then
  redis.call("EXPIRE", KEYS[1], ARGV[2], "NX")
end
if count > tonumber(ARGV[1]) then return 0 end
return 1
"#;

pub struct RateLimiter {
    pool: Pool,
}

impl RateLimiter {
    #[must_use]
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Returns `true` if the call is within budget, `false` if the bucket
    /// is exhausted for the remainder of `window`.
    pub async fn check(
        &self,
        bucket: &str,
        limit: u32,
        window: std::time::Duration,
    ) -> Result<bool, InternalError> {
        let mut conn = self.pool.get().await.map_err(|e| {
            InternalError(failure::format_err!("redis pool checkout failed: {}", e))
        })?;
        let allowed: i64 = Script::new(CHECK_AND_INCREMENT)
            .key(redis_keys::ratelimit_bucket(bucket))
            .arg(limit)
            .arg(window.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(allowed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn limiter() -> RateLimiter {
        let url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let mut cfg = deadpool_redis::Config::from_url(url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(4));
        let pool = cfg
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .unwrap();
        RateLimiter::new(pool)
    }

    #[tokio::test]
    #[ignore]
    async fn rejects_once_bucket_is_exhausted() {
        let limiter = limiter().await;
        let bucket = "test-bucket-gift";
        for _ in 0..3 {
            assert!(limiter
                .check(bucket, 3, std::time::Duration::from_secs(60))
                .await
                .unwrap());
        }
        assert!(!limiter
            .check(bucket, 3, std::time::Duration::from_secs(60))
            .await
            .unwrap());
    }
}
