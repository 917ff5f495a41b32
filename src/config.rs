//! Layered configuration loading (§6 "Environment configuration").
//!
//! Defaults are baked in via [`smart_default`], then overridden by
//! `config/default.toml` (if present) and finally by environment variables,
//! using the variable names enumerated in §6 verbatim rather than a
//! generic `MSAB__SECTION__KEY` scheme — operators copy-paste these names
//! straight out of the spec.

use std::time::Duration;

use serde::Deserialize;
use smart_default::SmartDefault;

/// Root settings object, parsed once at startup and shared as `Arc<Settings>`.
#[derive(Clone, Debug, Deserialize, SmartDefault)]
#[serde(default)]
pub struct Settings {
    #[default(_code = "\"0.0.0.0:8080\".to_string()")]
    pub bind_addr: String,

    pub jwt: JwtSettings,
    pub laravel: LaravelSettings,
    pub redis: RedisSettings,
    pub media: MediaSettings,
    pub relay: RelaySettings,
    pub gift: GiftSettings,
    pub seats: SeatSettings,
    pub cors: CorsSettings,
}

#[derive(Clone, Debug, Deserialize, SmartDefault)]
#[serde(default)]
pub struct JwtSettings {
    /// `JWT_SECRET`. Shared HMAC secret, expected to be >= 32 bytes.
    #[default(_code = "String::new()")]
    pub secret: String,

    /// `JWT_MAX_AGE_SECONDS`. Fallback expiry when no `exp` claim is present.
    #[default(_code = "Duration::from_secs(86_400)")]
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
}

#[derive(Clone, Debug, Deserialize, SmartDefault)]
#[serde(default)]
pub struct LaravelSettings {
    /// `LARAVEL_API_URL`.
    #[default(_code = "\"http://localhost/internal\".to_string()")]
    pub api_url: String,

    /// `LARAVEL_INTERNAL_KEY`. Sent as `X-Internal-Key`.
    #[default(_code = "String::new()")]
    pub internal_key: String,

    /// `LARAVEL_API_TIMEOUT_MS`.
    #[default(_code = "Duration::from_millis(10_000)")]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Clone, Debug, Deserialize, SmartDefault)]
#[serde(default)]
pub struct RedisSettings {
    #[default(_code = "\"127.0.0.1\".to_string()")]
    pub host: String,
    #[default(6379)]
    pub port: u16,
    pub password: Option<String>,
    #[default(false)]
    pub tls: bool,
    #[default(0)]
    pub db: i64,
    #[default(16)]
    pub pool_size: usize,
}

impl RedisSettings {
    /// Renders the `redis://`/`rediss://` connection URL `deadpool-redis`
    /// and the plain `redis` client expect.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.tls { "rediss" } else { "redis" };
        match &self.password {
            Some(pass) => format!(
                "{scheme}://:{pass}@{host}:{port}/{db}",
                scheme = scheme,
                pass = pass,
                host = self.host,
                port = self.port,
                db = self.db,
            ),
            None => format!(
                "{scheme}://{host}:{port}/{db}",
                scheme = scheme,
                host = self.host,
                port = self.port,
                db = self.db,
            ),
        }
    }
}

#[derive(Clone, Debug, Deserialize, SmartDefault)]
#[serde(default)]
pub struct MediaSettings {
    #[default(_code = "\"0.0.0.0\".to_string()")]
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    #[default(40_000)]
    pub rtc_min_port: u16,
    #[default(49_999)]
    pub rtc_max_port: u16,
    /// `MAX_ACTIVE_SPEAKERS_FORWARDED`.
    #[default(3)]
    pub max_active_speakers_forwarded: usize,
    /// `MAX_LISTENERS_PER_DISTRIBUTION_ROUTER`.
    #[default(500)]
    pub max_listeners_per_distribution_router: usize,
    /// Window over which a dominant-speaker event keeps a producer "recent".
    #[default(_code = "Duration::from_millis(10_000)")]
    #[serde(with = "humantime_serde")]
    pub active_speaker_window: Duration,
}

#[derive(Clone, Debug, Deserialize, SmartDefault)]
#[serde(default)]
pub struct RelaySettings {
    /// `MSAB_EVENTS_CHANNEL`.
    #[default(_code = "\"flylive:msab:events\".to_string()")]
    pub channel: String,
    /// `MSAB_EVENTS_ENABLED`.
    #[default(true)]
    pub enabled: bool,
    /// Threshold for the back-pressure warning on the in-flight gauge.
    #[default(1000)]
    pub in_flight_warn_threshold: u64,
}

#[derive(Clone, Debug, Deserialize, SmartDefault)]
#[serde(default)]
pub struct GiftSettings {
    /// `GIFT_BUFFER_FLUSH_INTERVAL_MS`.
    #[default(_code = "Duration::from_millis(5_000)")]
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// `GIFT_MAX_RETRIES`.
    #[default(4)]
    pub max_retries: u32,
    #[default(10_000)]
    pub dead_letter_cap: usize,
    /// Token-bucket capacity for `gift:send`, events per window.
    #[default(330)]
    pub rate_limit_events: u32,
    #[default(_code = "Duration::from_secs(60)")]
    #[serde(with = "humantime_serde")]
    pub rate_limit_window: Duration,
}

#[derive(Clone, Debug, Deserialize, SmartDefault)]
#[serde(default)]
pub struct SeatSettings {
    /// `DEFAULT_SEAT_COUNT`.
    #[default(15)]
    pub default_count: u32,
    /// `INVITE_EXPIRY_SECONDS`.
    #[default(30)]
    pub invite_expiry_seconds: u64,
    /// Periodic auto-close scan interval.
    #[default(_code = "Duration::from_secs(60)")]
    #[serde(with = "humantime_serde")]
    pub auto_close_scan_interval: Duration,
    /// `INACTIVITY_THRESHOLD`.
    #[default(_code = "Duration::from_secs(600)")]
    #[serde(with = "humantime_serde")]
    pub inactivity_threshold: Duration,
}

#[derive(Clone, Debug, Deserialize, SmartDefault)]
#[serde(default)]
pub struct CorsSettings {
    /// `CORS_ORIGINS`.
    pub origins: Vec<String>,
}

impl Settings {
    /// Loads settings the way `mock/control-api/src/main.rs` bootstraps
    /// itself: `.env` first (best-effort), then a config file, then
    /// environment variables taking final precedence.
    ///
    /// # Errors
    ///
    /// Returns an error if `config/default.toml` exists but fails to parse,
    /// or if environment overrides don't deserialize into [`Settings`].
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::new();
        builder.merge(config::Config::try_from(&Settings::default())?)?;
        builder
            .merge(config::File::with_name("config/default").required(false))?;
        builder.merge(config::Environment::with_prefix("MSAB").separator("__"))?;

        // Spec-named variables are read individually so operators can use
        // the exact names from §6 instead of the generic MSAB__ scheme.
        for (key, env_var) in Self::spec_env_vars() {
            if let Ok(val) = std::env::var(env_var) {
                builder.set(key, val)?;
            }
        }

        builder.try_into()
    }

    /// (config-path, environment variable name) pairs for every variable
    /// enumerated in §6.
    fn spec_env_vars() -> Vec<(&'static str, &'static str)> {
        vec![
            ("jwt.secret", "JWT_SECRET"),
            ("jwt.max_age", "JWT_MAX_AGE_SECONDS"),
            ("laravel.api_url", "LARAVEL_API_URL"),
            ("laravel.internal_key", "LARAVEL_INTERNAL_KEY"),
            ("laravel.timeout", "LARAVEL_API_TIMEOUT_MS"),
            ("redis.host", "REDIS_HOST"),
            ("redis.port", "REDIS_PORT"),
            ("redis.password", "REDIS_PASSWORD"),
            ("redis.tls", "REDIS_TLS"),
            ("redis.db", "REDIS_DB"),
            ("media.listen_ip", "MEDIASOUP_LISTEN_IP"),
            ("media.announced_ip", "MEDIASOUP_ANNOUNCED_IP"),
            ("media.rtc_min_port", "MEDIASOUP_RTC_MIN_PORT"),
            ("media.rtc_max_port", "MEDIASOUP_RTC_MAX_PORT"),
            (
                "media.max_active_speakers_forwarded",
                "MAX_ACTIVE_SPEAKERS_FORWARDED",
            ),
            (
                "media.max_listeners_per_distribution_router",
                "MAX_LISTENERS_PER_DISTRIBUTION_ROUTER",
            ),
            ("relay.channel", "MSAB_EVENTS_CHANNEL"),
            ("relay.enabled", "MSAB_EVENTS_ENABLED"),
            ("gift.flush_interval", "GIFT_BUFFER_FLUSH_INTERVAL_MS"),
            ("gift.max_retries", "GIFT_MAX_RETRIES"),
            ("seats.default_count", "DEFAULT_SEAT_COUNT"),
            ("seats.invite_expiry_seconds", "INVITE_EXPIRY_SECONDS"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let s = Settings::default();
        assert_eq!(s.seats.default_count, 15);
        assert_eq!(s.media.max_active_speakers_forwarded, 3);
        assert_eq!(s.gift.max_retries, 3);
        assert_eq!(s.relay.channel, "flylive:msab:events");
    }

    #[test]
    fn redis_url_includes_password_when_set() {
        let mut s = RedisSettings::default();
        s.password = Some("hunter2".to_string());
        assert!(s.url().contains(":hunter2@"));
    }
}
