//! §4.9 `GiftBuffer` — durable at-least-once delivery of gift transactions
//! to the business backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use redis::AsyncCommands;
use serde_json::json;
use slog::{debug, error, o, warn, Logger};
use uuid::Uuid;

use crate::backend::{BackendClient, GiftBatchRequest};
use crate::error::InternalError;
use crate::redis_keys;
use crate::redis_pool::Pool;

use super::model::GiftTransaction;

const RENAME_PENDING: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 0 then return 0 end
redis.call("RENAME", KEYS[1], KEYS[2])
return 1
"#;

/// Invoked once per failed/dead-lettered transaction so the session layer
/// can emit `gift:error` to the sender's sockets.
pub type OnGiftError = Box<dyn Fn(&GiftTransaction, &str, &str) + Send + Sync>;

pub struct GiftBuffer {
    pool: Pool,
    backend: Arc<BackendClient>,
    instance_tag: String,
    max_retries: u32,
    dead_letter_cap: isize,
    flush_count: AtomicU64,
    on_error: OnGiftError,
    log: Logger,
}

impl GiftBuffer {
    #[must_use]
    pub fn new(
        pool: Pool,
        backend: Arc<BackendClient>,
        max_retries: u32,
        dead_letter_cap: usize,
        on_error: OnGiftError,
        log: Logger,
    ) -> Self {
        Self {
            pool,
            backend,
            instance_tag: Uuid::new_v4().to_string(),
            max_retries,
            dead_letter_cap: dead_letter_cap as isize,
            flush_count: AtomicU64::new(0),
            on_error,
            log: log.new(o!("component" => "gift_buffer")),
        }
    }

    async fn conn(&self) -> Result<crate::redis_pool::Connection, InternalError> {
        Ok(self.pool.get().await.map_err(|e| {
            InternalError(failure::format_err!("redis pool checkout failed: {}", e))
        })?)
    }

    pub async fn enqueue(&self, gift: &GiftTransaction) -> Result<(), InternalError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(gift)?;
        let _: i64 = conn.rpush(redis_keys::GIFTS_PENDING, payload).await?;
        Ok(())
    }

    /// One flush cycle. Returns the number of transactions processed
    /// (successfully submitted or dead-lettered), for tests/logging.
    pub async fn flush_once(&self) -> Result<usize, InternalError> {
        let processing_key =
            redis_keys::gifts_processing(&self.instance_tag, &Uuid::new_v4().to_string());

        let mut conn = self.conn().await?;
        let renamed: i64 = redis::Script::new(RENAME_PENDING)
            .key(redis_keys::GIFTS_PENDING)
            .key(&processing_key)
            .invoke_async(&mut conn)
            .await?;
        if renamed == 0 {
            return Ok(0);
        }

        let raw_entries: Vec<String> = conn.lrange(&processing_key, 0, -1).await?;

        let mut valid = Vec::new();
        for raw in raw_entries {
            match serde_json::from_str::<GiftTransaction>(&raw) {
                Ok(gift) => valid.push(gift),
                Err(e) => {
                    warn!(self.log, "dropping unparseable gift transaction";
                        "error" => %e);
                    self.push_dead_letter(&mut conn, &raw).await?;
                }
            }
        }

        if valid.is_empty() {
            let _: () = conn.del(&processing_key).await?;
            return Ok(0);
        }

        let request = GiftBatchRequest {
            transactions: valid
                .iter()
                .map(|g| {
                    json!({
                        "transaction_id": g.transaction_id,
                        "room_id": g.room_id,
                        "sender_user_id": g.sender_user_id,
                        "recipient_user_id": g.recipient_user_id,
                        "gift_id": g.gift_id,
                        "quantity": g.quantity,
                        "timestamp_ms": g.timestamp_ms,
                    })
                })
                .collect(),
        };

        let processed = valid.len();
        match self.backend.submit_gift_batch(&request).await {
            Ok(response) => {
                for failure in response.failed {
                    if let Some(gift) = valid
                        .iter()
                        .find(|g| g.transaction_id.to_string() == failure.transaction_id)
                    {
                        (self.on_error)(gift, &failure.code, &failure.reason);
                    }
                }
                let _: () = conn.del(&processing_key).await?;
            }
            Err(e) => {
                warn!(self.log, "gift batch submission failed, retrying";
                    "error" => %e, "count" => valid.len());
                let mut pipe = redis::pipe();
                for mut gift in valid {
                    gift.retry_count += 1;
                    if gift.retry_count >= self.max_retries {
                        (self.on_error)(&gift, "PROCESSING_FAILED", "max retries exceeded");
                        let payload = serde_json::to_string(&gift)?;
                        pipe.lpush(redis_keys::GIFTS_DEAD_LETTER, payload)
                            .ltrim(redis_keys::GIFTS_DEAD_LETTER, 0, self.dead_letter_cap - 1);
                    } else {
                        let payload = serde_json::to_string(&gift)?;
                        pipe.rpush(redis_keys::GIFTS_PENDING, payload);
                    }
                }
                pipe.del(&processing_key);
                pipe.query_async(&mut conn).await?;
            }
        }

        let flush_number = self.flush_count.fetch_add(1, Ordering::Relaxed) + 1;
        if flush_number % 10 == 0 {
            let len: i64 = conn.llen(redis_keys::GIFTS_DEAD_LETTER).await?;
            debug!(self.log, "dead-letter queue depth"; "length" => len);
        }

        Ok(processed)
    }

    async fn push_dead_letter(
        &self,
        conn: &mut crate::redis_pool::Connection,
        raw: &str,
    ) -> Result<(), InternalError> {
        redis::pipe()
            .lpush(redis_keys::GIFTS_DEAD_LETTER, raw)
            .ltrim(redis_keys::GIFTS_DEAD_LETTER, 0, self.dead_letter_cap - 1)
            .query_async(conn)
            .await?;
        Ok(())
    }

    /// Periodic task entry point: runs until `shutdown` resolves, flushing
    /// every `interval`, with one final flush before returning (§5
    /// graceful shutdown step iii).
    pub async fn run(
        self: Arc<Self>,
        interval: std::time::Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush_once().await {
                        error!(self.log, "gift buffer flush failed"; "error" => %e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        if let Err(e) = self.flush_once().await {
            error!(self.log, "final gift buffer flush failed"; "error" => %e);
        }
    }
}
