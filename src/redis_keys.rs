//! Central key-layout helpers (§6 "Redis key layout").
//!
//! Every Redis key the core owns is built here, so the string format is
//! defined exactly once and every module (`seats`, `users`, `gifts`, `auth`,
//! `ratelimit`) shares it instead of re-deriving its own format string.

pub fn room_state(room_id: &str) -> String {
    format!("room:state:{}", room_id)
}

pub fn seats(room_id: &str) -> String {
    format!("seats:{}", room_id)
}

pub fn locked(room_id: &str) -> String {
    format!("locked:{}", room_id)
}

pub fn user_seat(room_id: &str) -> String {
    format!("userSeat:{}", room_id)
}

pub fn invite(room_id: &str, seat_index: u32) -> String {
    format!("invite:{}:{}", room_id, seat_index)
}

pub fn invite_scan_pattern(room_id: &str) -> String {
    format!("invite:{}:*", room_id)
}

pub fn user_sockets(user_id: &str) -> String {
    format!("user:{}:sockets", user_id)
}

pub fn user_room(user_id: &str) -> String {
    format!("user:{}:room", user_id)
}

pub fn auth_revoked(token_hash: &str) -> String {
    format!("auth:revoked:{}", token_hash)
}

pub fn ratelimit_bucket(bucket: &str) -> String {
    format!("ratelimit:{}", bucket)
}

pub const GIFTS_PENDING: &str = "gifts:pending";
pub const GIFTS_DEAD_LETTER: &str = "gifts:dead_letter";

pub fn gifts_processing(instance_tag: &str, batch_id: &str) -> String {
    format!("gifts:processing:{}:{}", instance_tag, batch_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_match_spec_layout() {
        assert_eq!(room_state("42"), "room:state:42");
        assert_eq!(seats("42"), "seats:42");
        assert_eq!(locked("42"), "locked:42");
        assert_eq!(user_seat("42"), "userSeat:42");
        assert_eq!(invite("42", 3), "invite:42:3");
        assert_eq!(user_sockets("7"), "user:7:sockets");
        assert_eq!(user_room("7"), "user:7:room");
        assert_eq!(auth_revoked("abc"), "auth:revoked:abc");
        assert_eq!(ratelimit_bucket("gift:7"), "ratelimit:gift:7");
    }
}
