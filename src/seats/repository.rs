//! §4.4 `SeatRepository` — every mutation is one Lua script, so the four
//! keys a room's seat state spans (`seats`, `locked`, `userSeat`, the
//! per-seat `invite`) never diverge.

use redis::AsyncCommands;
use redis::Script;

use crate::error::{AppError, InternalError};
use crate::redis_keys;
use crate::redis_pool::Pool;

use super::model::{Invite, LockOutcome, Seat, SeatRecord};

pub struct SeatRepository {
    pool: Pool,
}

const TAKE_SEAT: &str = r#"
local idx = tonumber(ARGV[1])
local max = tonumber(ARGV[3])
if idx < 0 or idx >= max then return "OUT_OF_RANGE" end
if redis.call("SISMEMBER", KEYS[2], ARGV[1]) == 1 then return "LOCKED" end
if redis.call("HEXISTS", KEYS[3], ARGV[2]) == 1 then return "ALREADY_SEATED" end
local existing = redis.call("HGET", KEYS[1], ARGV[1])
if existing then
  local obj = cjson.decode(existing)
  if obj.userId then return "TAKEN" end
end
redis.call("HSET", KEYS[1], ARGV[1], cjson.encode({userId=ARGV[2], muted=false}))
redis.call("HSET", KEYS[3], ARGV[2], ARGV[1])
return "OK"
"#;

const LEAVE_SEAT: &str = r#"
local idx = redis.call("HGET", KEYS[2], ARGV[1])
if not idx then return false end
redis.call("HDEL", KEYS[2], ARGV[1])
local existing = redis.call("HGET", KEYS[1], idx)
if existing then
  local obj = cjson.decode(existing)
  redis.call("HSET", KEYS[1], idx, cjson.encode({muted=obj.muted}))
end
return idx
"#;

const ASSIGN_SEAT: &str = r#"
local idx = tonumber(ARGV[1])
local max = tonumber(ARGV[3])
if idx < 0 or idx >= max then return "OUT_OF_RANGE" end
local existing = redis.call("HGET", KEYS[1], ARGV[1])
if existing then
  local obj = cjson.decode(existing)
  if obj.userId then return "TAKEN" end
end
local prev = redis.call("HGET", KEYS[2], ARGV[2])
if prev then
  redis.call("HDEL", KEYS[2], ARGV[2])
  local prevRaw = redis.call("HGET", KEYS[1], prev)
  if prevRaw then
    local prevObj = cjson.decode(prevRaw)
    redis.call("HSET", KEYS[1], prev, cjson.encode({muted=prevObj.muted}))
  end
end
redis.call("HSET", KEYS[1], ARGV[1], cjson.encode({userId=ARGV[2], muted=false}))
redis.call("HSET", KEYS[2], ARGV[2], ARGV[1])
return "OK"
"#;

const SET_MUTE: &str = r#"
local existing = redis.call("HGET", KEYS[1], ARGV[1])
if not existing then return false end
local obj = cjson.decode(existing)
if not obj.userId then return false end
obj.muted = (ARGV[2] == "1")
redis.call("HSET", KEYS[1], ARGV[1], cjson.encode(obj))
return true
"#;

const LOCK_SEAT: &str = r#"
if redis.call("SISMEMBER", KEYS[1], ARGV[1]) == 1 then return "ALREADY_LOCKED" end
redis.call("SADD", KEYS[1], ARGV[1])
local existing = redis.call("HGET", KEYS[2], ARGV[1])
if existing then
  local obj = cjson.decode(existing)
  if obj.userId then
    redis.call("HDEL", KEYS[3], obj.userId)
    redis.call("HSET", KEYS[2], ARGV[1], cjson.encode({muted=obj.muted}))
    return cjson.encode({kickedUserId=obj.userId})
  end
end
return cjson.encode({})
"#;

const UNLOCK_SEAT: &str = r#"
if redis.call("SISMEMBER", KEYS[1], ARGV[1]) == 0 then return "NOT_LOCKED" end
redis.call("SREM", KEYS[1], ARGV[1])
return "OK"
"#;

const CREATE_INVITE: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then return false end
local existingIdx = redis.call("HGET", KEYS[2], ARGV[2])
if existingIdx then
  local existingKey = ARGV[6] .. existingIdx
  if redis.call("EXISTS", existingKey) == 1 then
    return false
  end
  redis.call("HDEL", KEYS[2], ARGV[2])
end
redis.call("SETEX", KEYS[1], tonumber(ARGV[5]), cjson.encode({
  targetUserId = ARGV[2], inviterUserId = ARGV[3], createdAtMs = tonumber(ARGV[4])
}))
redis.call("HSET", KEYS[2], ARGV[2], ARGV[1])
return true
"#;

impl SeatRepository {
    #[must_use]
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<crate::redis_pool::Connection, InternalError> {
        Ok(self.pool.get().await.map_err(|e| {
            InternalError(failure::format_err!("redis pool checkout failed: {}", e))
        })?)
    }

    fn invite_target_hash(room_id: &str) -> String {
        format!("inviteTarget:{}", room_id)
    }

    pub async fn take_seat(
        &self,
        room_id: &str,
        user_id: &str,
        index: u32,
        max_seats: u32,
    ) -> Result<(), AppError> {
        let mut conn = self.conn().await?;
        let result: String = Script::new(TAKE_SEAT)
            .key(redis_keys::seats(room_id))
            .key(redis_keys::locked(room_id))
            .key(redis_keys::user_seat(room_id))
            .arg(index)
            .arg(user_id)
            .arg(max_seats)
            .invoke_async(&mut conn)
            .await
            .map_err(InternalError::from)?;
        match result.as_str() {
            "OK" => Ok(()),
            "OUT_OF_RANGE" => Err(AppError::SeatOutOfRange),
            "LOCKED" => Err(AppError::SeatLocked),
            "ALREADY_SEATED" => Err(AppError::AlreadySeated),
            "TAKEN" => Err(AppError::SeatTaken),
            _ => Err(AppError::Internal),
        }
    }

    /// Returns the vacated seat index, or `None` if the user wasn't seated.
    pub async fn leave_seat(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<Option<u32>, AppError> {
        let mut conn = self.conn().await?;
        let result: Option<u32> = Script::new(LEAVE_SEAT)
            .key(redis_keys::seats(room_id))
            .key(redis_keys::user_seat(room_id))
            .arg(user_id)
            .invoke_async(&mut conn)
            .await
            .map_err(InternalError::from)?;
        Ok(result)
    }

    pub async fn assign_seat(
        &self,
        room_id: &str,
        user_id: &str,
        index: u32,
        max_seats: u32,
    ) -> Result<(), AppError> {
        let mut conn = self.conn().await?;
        let result: String = Script::new(ASSIGN_SEAT)
            .key(redis_keys::seats(room_id))
            .key(redis_keys::user_seat(room_id))
            .arg(index)
            .arg(user_id)
            .arg(max_seats)
            .invoke_async(&mut conn)
            .await
            .map_err(InternalError::from)?;
        match result.as_str() {
            "OK" => Ok(()),
            "OUT_OF_RANGE" => Err(AppError::SeatOutOfRange),
            "TAKEN" => Err(AppError::SeatTaken),
            _ => Err(AppError::Internal),
        }
    }

    /// Identical state transition to `leave_seat`; kept as a distinct
    /// method name because callers (self-leave vs. manager-remove) carry
    /// different authorization checks upstream.
    pub async fn remove_seat(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<u32, AppError> {
        self.leave_seat(room_id, user_id)
            .await?
            .ok_or(AppError::UserNotSeated)
    }

    pub async fn set_mute(
        &self,
        room_id: &str,
        index: u32,
        muted: bool,
    ) -> Result<(), AppError> {
        let mut conn = self.conn().await?;
        let ok: bool = Script::new(SET_MUTE)
            .key(redis_keys::seats(room_id))
            .arg(index)
            .arg(if muted { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .map_err(InternalError::from)?;
        if ok {
            Ok(())
        } else {
            Err(AppError::UserNotSeated)
        }
    }

    pub async fn lock_seat(
        &self,
        room_id: &str,
        index: u32,
    ) -> Result<LockOutcome, AppError> {
        let mut conn = self.conn().await?;
        let result: String = Script::new(LOCK_SEAT)
            .key(redis_keys::locked(room_id))
            .key(redis_keys::seats(room_id))
            .key(redis_keys::user_seat(room_id))
            .arg(index)
            .invoke_async(&mut conn)
            .await
            .map_err(InternalError::from)?;
        if result == "ALREADY_LOCKED" {
            return Err(AppError::SeatAlreadyLocked);
        }
        serde_json::from_str(&result)
            .map_err(|e| AppError::from(InternalError::from(e)))
    }

    pub async fn unlock_seat(&self, room_id: &str, index: u32) -> Result<(), AppError> {
        let mut conn = self.conn().await?;
        let result: String = Script::new(UNLOCK_SEAT)
            .key(redis_keys::locked(room_id))
            .arg(index)
            .invoke_async(&mut conn)
            .await
            .map_err(InternalError::from)?;
        match result.as_str() {
            "OK" => Ok(()),
            "NOT_LOCKED" => Err(AppError::SeatNotLocked),
            _ => Err(AppError::Internal),
        }
    }

    pub async fn create_invite(
        &self,
        room_id: &str,
        index: u32,
        target_user_id: &str,
        inviter_user_id: &str,
        created_at_ms: i64,
        ttl_seconds: u64,
    ) -> Result<bool, InternalError> {
        let mut conn = self.conn().await?;
        let prefix = format!("invite:{}:", room_id);
        Script::new(CREATE_INVITE)
            .key(redis_keys::invite(room_id, index))
            .key(Self::invite_target_hash(room_id))
            .arg(index)
            .arg(target_user_id)
            .arg(inviter_user_id)
            .arg(created_at_ms)
            .arg(ttl_seconds)
            .arg(prefix)
            .invoke_async(&mut conn)
            .await
            .map_err(InternalError::from)
    }

    pub async fn get_invite(
        &self,
        room_id: &str,
        index: u32,
    ) -> Result<Option<Invite>, InternalError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> =
            conn.get(redis_keys::invite(room_id, index)).await?;
        Ok(match raw {
            Some(s) => {
                let mut invite: Invite =
                    serde_json::from_str(&s).map_err(InternalError::from)?;
                invite.seat_index = index;
                Some(invite)
            }
            None => None,
        })
    }

    pub async fn get_invite_by_user(
        &self,
        room_id: &str,
        target_user_id: &str,
    ) -> Result<Option<Invite>, InternalError> {
        let mut conn = self.conn().await?;
        let idx: Option<u32> = conn
            .hget(Self::invite_target_hash(room_id), target_user_id)
            .await?;
        match idx {
            Some(idx) => self.get_invite(room_id, idx).await,
            None => Ok(None),
        }
    }

    pub async fn delete_invite(
        &self,
        room_id: &str,
        index: u32,
        target_user_id: &str,
    ) -> Result<(), InternalError> {
        let mut conn = self.conn().await?;
        redis::pipe()
            .del(redis_keys::invite(room_id, index))
            .hdel(Self::invite_target_hash(room_id), target_user_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Deletes every key this repository owns for a room. Not a single
    /// atomic script: the invite keys are discovered by `KEYS` scan
    /// because each has its own TTL-bearing key name, which is acceptable
    /// only because this runs once at room close, never on a hot path.
    pub async fn clear_room(&self, room_id: &str) -> Result<(), InternalError> {
        let mut conn = self.conn().await?;
        let invite_keys: Vec<String> = redis::cmd("KEYS")
            .arg(redis_keys::invite_scan_pattern(room_id))
            .query_async(&mut conn)
            .await?;

        let mut pipe = redis::pipe();
        pipe.del(redis_keys::seats(room_id))
            .del(redis_keys::locked(room_id))
            .del(redis_keys::user_seat(room_id))
            .del(Self::invite_target_hash(room_id));
        for key in invite_keys {
            pipe.del(key);
        }
        pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn get_seats(
        &self,
        room_id: &str,
        max_seats: u32,
    ) -> Result<Vec<Seat>, InternalError> {
        let mut conn = self.conn().await?;
        let raw: Vec<(u32, String)> =
            conn.hgetall(redis_keys::seats(room_id)).await?;
        let locked: std::collections::HashSet<u32> =
            conn.smembers(redis_keys::locked(room_id)).await?;

        let mut records = std::collections::HashMap::new();
        for (idx, json) in raw {
            let record: SeatRecord = serde_json::from_str(&json)?;
            records.insert(idx, record);
        }

        Ok((0..max_seats)
            .map(|index| {
                let record = records.remove(&index).unwrap_or_default();
                Seat {
                    index,
                    user_id: record.user_id,
                    muted: record.muted,
                    locked: locked.contains(&index),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Requires a local Redis at `REDIS_URL` (defaults to
    /// `redis://127.0.0.1/`); skipped in environments without one.
    async fn repo() -> SeatRepository {
        let url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let mut cfg = deadpool_redis::Config::from_url(url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(4));
        let pool = cfg
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .unwrap();
        SeatRepository::new(pool)
    }

    #[tokio::test]
    #[ignore]
    async fn take_seat_then_leave_round_trips_userseat_index() {
        let repo = repo().await;
        let room = "test-room-take-leave";
        repo.clear_room(room).await.unwrap();

        repo.take_seat(room, "u1", 0, 15).await.unwrap();
        let err = repo.take_seat(room, "u2", 0, 15).await.unwrap_err();
        assert_eq!(err, AppError::SeatTaken);

        let vacated = repo.leave_seat(room, "u1").await.unwrap();
        assert_eq!(vacated, Some(0));

        repo.take_seat(room, "u2", 0, 15).await.unwrap();
        repo.clear_room(room).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn lock_seat_vacates_occupant_and_reports_kicked_user() {
        let repo = repo().await;
        let room = "test-room-lock";
        repo.clear_room(room).await.unwrap();

        repo.take_seat(room, "u1", 2, 15).await.unwrap();
        let outcome = repo.lock_seat(room, 2).await.unwrap();
        assert_eq!(outcome.kicked_user_id.as_deref(), Some("u1"));

        let err = repo.take_seat(room, "u2", 2, 15).await.unwrap_err();
        assert_eq!(err, AppError::SeatLocked);

        repo.clear_room(room).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn create_invite_rejects_second_invite_for_same_target() {
        let repo = repo().await;
        let room = "test-room-invite";
        repo.clear_room(room).await.unwrap();

        let first = repo
            .create_invite(room, 0, "target", "inviter1", 1000, 30)
            .await
            .unwrap();
        assert!(first);

        let second = repo
            .create_invite(room, 1, "target", "inviter2", 1000, 30)
            .await
            .unwrap();
        assert!(!second);

        repo.clear_room(room).await.unwrap();
    }
}
