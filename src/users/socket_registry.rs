//! §4.7 `UserSocketRegistry` — Redis-backed user→socket and user→room
//! mappings, each with a 24h TTL.

use redis::AsyncCommands;
use redis::Script;

use crate::error::InternalError;
use crate::redis_keys;
use crate::redis_pool::Pool;

const SOCKET_TTL_SECONDS: usize = 24 * 60 * 60;
const ROOM_TTL_SECONDS: usize = 24 * 60 * 60;

const UNREGISTER_SOCKET: &str = r#"
redis.call("SREM", KEYS[1], ARGV[1])
if redis.call("SCARD", KEYS[1]) == 0 then
  redis.call("DEL", KEYS[1])
end
return 1
"#;

pub struct UserSocketRegistry {
    pool: Pool,
}

impl UserSocketRegistry {
    #[must_use]
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<crate::redis_pool::Connection, InternalError> {
        Ok(self.pool.get().await.map_err(|e| {
            InternalError(failure::format_err!("redis pool checkout failed: {}", e))
        })?)
    }

    pub async fn register_socket(
        &self,
        user_id: &str,
        socket_id: &str,
    ) -> Result<(), InternalError> {
        let mut conn = self.conn().await?;
        redis::pipe()
            .sadd(redis_keys::user_sockets(user_id), socket_id)
            .expire(redis_keys::user_sockets(user_id), SOCKET_TTL_SECONDS)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn unregister_socket(
        &self,
        user_id: &str,
        socket_id: &str,
    ) -> Result<(), InternalError> {
        let mut conn = self.conn().await?;
        let _: i64 = Script::new(UNREGISTER_SOCKET)
            .key(redis_keys::user_sockets(user_id))
            .arg(socket_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn sockets_for(&self, user_id: &str) -> Result<Vec<String>, InternalError> {
        let mut conn = self.conn().await?;
        Ok(conn.smembers(redis_keys::user_sockets(user_id)).await?)
    }

    pub async fn set_user_room(
        &self,
        user_id: &str,
        room_id: &str,
    ) -> Result<(), InternalError> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .set_ex(redis_keys::user_room(user_id), room_id, ROOM_TTL_SECONDS)
            .await?;
        Ok(())
    }

    pub async fn clear_user_room(&self, user_id: &str) -> Result<(), InternalError> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(redis_keys::user_room(user_id)).await?;
        Ok(())
    }

    pub async fn get_user_room(
        &self,
        user_id: &str,
    ) -> Result<Option<String>, InternalError> {
        let mut conn = self.conn().await?;
        Ok(conn.get(redis_keys::user_room(user_id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> UserSocketRegistry {
        let url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let mut cfg = deadpool_redis::Config::from_url(url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(4));
        let pool = cfg
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .unwrap();
        UserSocketRegistry::new(pool)
    }

    #[tokio::test]
    #[ignore]
    async fn unregistering_last_socket_deletes_the_set() {
        let registry = registry().await;
        let user = "test-user-sockets";
        registry.register_socket(user, "sock-1").await.unwrap();
        registry.unregister_socket(user, "sock-1").await.unwrap();
        let sockets = registry.sockets_for(user).await.unwrap();
        assert!(sockets.is_empty());
    }

    #[tokio::test]
    #[ignore]
    async fn user_room_round_trips() {
        let registry = registry().await;
        let user = "test-user-room";
        registry.set_user_room(user, "room-1").await.unwrap();
        assert_eq!(
            registry.get_user_room(user).await.unwrap().as_deref(),
            Some("room-1")
        );
        registry.clear_user_room(user).await.unwrap();
        assert_eq!(registry.get_user_room(user).await.unwrap(), None);
    }
}
