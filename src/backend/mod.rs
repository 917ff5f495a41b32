//! §6 business-backend HTTP client ("Laravel" in the original deployment).
//!
//! Every call carries the shared `X-Internal-Key` secret and an explicit
//! timeout; fire-and-forget call sites (room status, gift batches) log
//! failures instead of propagating them, per §7 "fire-and-forget business
//! backend calls log errors but never block user acknowledgement".

use serde::{Deserialize, Serialize};
use slog::{o, warn, Logger};

use crate::config::LaravelSettings;
use crate::error::InternalError;

#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    internal_key: String,
    log: Logger,
}

#[derive(Debug, Serialize)]
pub struct RoomStatusUpdate {
    pub is_live: bool,
    pub participant_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GiftBatchRequest {
    pub transactions: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct GiftBatchFailure {
    pub transaction_id: String,
    pub code: String,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct GiftBatchResponse {
    pub processed_count: u64,
    #[serde(default)]
    pub failed: Vec<GiftBatchFailure>,
}

#[derive(Debug, Deserialize)]
pub struct RoomData {
    pub id: String,
    #[serde(default)]
    pub owner_user_id: Option<String>,
}

impl BackendClient {
    /// # Panics
    ///
    /// Panics if the timeout can't be converted into a `reqwest` client
    /// builder, which only happens on a malformed TLS configuration.
    #[must_use]
    pub fn new(settings: &LaravelSettings, log: Logger) -> Self {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .expect("reqwest client builder must succeed");
        Self {
            http,
            base_url: settings.api_url.trim_end_matches('/').to_string(),
            internal_key: settings.internal_key.clone(),
            log: log.new(o!("component" => "backend_client")),
        }
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header("X-Internal-Key", &self.internal_key)
    }

    pub async fn submit_gift_batch(
        &self,
        req: &GiftBatchRequest,
    ) -> Result<GiftBatchResponse, InternalError> {
        let resp = self
            .request(reqwest::Method::POST, "/internal/gifts/batch")
            .json(req)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn update_room_status(
        &self,
        room_id: &str,
        update: &RoomStatusUpdate,
    ) -> Result<(), InternalError> {
        self.request(
            reqwest::Method::POST,
            &format!("/internal/rooms/{}/status", room_id),
        )
        .json(update)
        .send()
        .await?
        .error_for_status()?;
        Ok(())
    }

    /// Fire-and-forget variant of [`Self::update_room_status`] used by
    /// `RoomRegistry`: logs and swallows failures instead of propagating.
    pub async fn notify_room_status_best_effort(
        &self,
        room_id: &str,
        update: RoomStatusUpdate,
    ) {
        if let Err(e) = self.update_room_status(room_id, &update).await {
            warn!(self.log, "room status notification failed";
                "room_id" => room_id, "error" => %e);
        }
    }

    pub async fn get_room(&self, room_id: &str) -> Result<RoomData, InternalError> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/internal/rooms/{}", room_id))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}
