//! §6 token verification — a compact signed JSON token: three base64url
//! parts separated by `.`, HMAC-SHA256 over `header.payload`.

use hmac::{Hmac, Mac, NewMac};
use redis::AsyncCommands;
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::JwtSettings;
use crate::error::{AppError, InternalError};
use crate::redis_keys;
use crate::redis_pool::Pool;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    iat: Option<i64>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Identity {
    pub user_id: String,
}

pub struct TokenVerifier {
    secret: Vec<u8>,
    max_age_seconds: i64,
    redis: Pool,
}

impl TokenVerifier {
    #[must_use]
    pub fn new(settings: &JwtSettings, redis: Pool) -> Self {
        Self {
            secret: settings.secret.as_bytes().to_vec(),
            max_age_seconds: settings.max_age.as_secs() as i64,
            redis,
        }
    }

    /// Verifies signature, expiry, payload schema, and revocation, in that
    /// order (§6). Revocation check failure (Redis unreachable) fails
    /// closed — an `Internal`-mapped error, not silent acceptance.
    pub async fn verify(&self, token: &str) -> Result<Identity, AppError> {
        let mut parts = token.split('.');
        let header = parts.next().ok_or(AppError::InvalidCredentials)?;
        let payload = parts.next().ok_or(AppError::InvalidCredentials)?;
        let signature_b64 = parts.next().ok_or(AppError::InvalidCredentials)?;
        if parts.next().is_some() {
            return Err(AppError::InvalidCredentials);
        }

        let signing_input = format!("{}.{}", header, payload);
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| AppError::Internal)?;
        mac.update(signing_input.as_bytes());
        let expected = mac.finalize().into_bytes();

        let signature = base64::decode_config(signature_b64, base64::URL_SAFE_NO_PAD)
            .map_err(|_| AppError::InvalidCredentials)?;
        if expected.as_slice().ct_eq(&signature).unwrap_u8() != 1 {
            return Err(AppError::InvalidCredentials);
        }

        let payload_bytes = base64::decode_config(payload, base64::URL_SAFE_NO_PAD)
            .map_err(|_| AppError::InvalidCredentials)?;
        let claims: Claims = serde_json::from_slice(&payload_bytes)
            .map_err(|_| AppError::InvalidCredentials)?;

        let now = chrono::Utc::now().timestamp();
        let expires_at = claims
            .exp
            .or_else(|| claims.iat.map(|iat| iat + self.max_age_seconds));
        match expires_at {
            Some(exp) if now > exp => return Err(AppError::AuthFailed),
            None => return Err(AppError::InvalidCredentials),
            _ => {}
        }

        if claims.user_id.is_empty() {
            return Err(AppError::InvalidCredentials);
        }

        self.check_not_revoked(token).await?;

        Ok(Identity {
            user_id: claims.user_id,
        })
    }

    async fn check_not_revoked(&self, token: &str) -> Result<(), AppError> {
        let hash = token_hash(token);
        let mut conn = self.redis.get().await.map_err(|e| {
            AppError::from(InternalError(failure::format_err!(
                "redis pool checkout failed: {}",
                e
            )))
        })?;
        let revoked: bool = conn
            .sismember(redis_keys::auth_revoked(&hash), "1")
            .await
            .map_err(|e| AppError::from(InternalError::from(e)))?;
        if revoked {
            Err(AppError::AuthFailed)
        } else {
            Ok(())
        }
    }
}

fn token_hash(token: &str) -> String {
    use sha2::Digest;
    let digest = Sha256::digest(token.as_bytes());
    base64::encode_config(digest, base64::URL_SAFE_NO_PAD)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, payload_json: &str) -> String {
        let header = base64::encode_config(b"{\"alg\":\"HS256\"}", base64::URL_SAFE_NO_PAD);
        let payload = base64::encode_config(payload_json, base64::URL_SAFE_NO_PAD);
        let signing_input = format!("{}.{}", header, payload);
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(signing_input.as_bytes());
        let sig = base64::encode_config(mac.finalize().into_bytes(), base64::URL_SAFE_NO_PAD);
        format!("{}.{}.{}", header, payload, sig)
    }

    #[test]
    fn rejects_tampered_signature() {
        let secret = "a".repeat(32);
        let token = sign(&secret, r#"{"userId":"u1","exp":9999999999}"#);
        let mut parts: Vec<&str> = token.split('.').collect();
        let tampered_payload =
            base64::encode_config(r#"{"userId":"attacker","exp":9999999999}"#, base64::URL_SAFE_NO_PAD);
        parts[1] = &tampered_payload;
        let tampered = parts.join(".");

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", parts[0], parts[1]).as_bytes());
        let expected = mac.finalize().into_bytes();
        let original_sig =
            base64::decode_config(parts[2], base64::URL_SAFE_NO_PAD).unwrap();
        assert_ne!(expected.as_slice(), original_sig.as_slice());
        assert_ne!(tampered, token);
    }

    #[test]
    fn token_hash_is_deterministic() {
        assert_eq!(token_hash("abc"), token_hash("abc"));
        assert_ne!(token_hash("abc"), token_hash("abd"));
    }
}
