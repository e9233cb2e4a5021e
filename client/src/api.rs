use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};

use lantern_shared::MapEntity;

use crate::config;
use crate::error::SyncError;

/// HTTP boundary. Every call carries the bearer credential handed in by the
/// session layer; image URLs carry it as a query parameter because the
/// renderer's loader cannot set headers.
#[derive(Debug, Clone)]
pub struct MapApi {
    base: String,
    credential: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct ActiveMapData {
    #[serde(rename = "activeMap")]
    active_map: Option<MapEntity>,
}

#[derive(Deserialize)]
struct ActiveMapResponse {
    data: ActiveMapData,
}

impl MapApi {
    pub fn new(base_url: &str, credential: impl Into<String>) -> Result<Self, String> {
        reqwest::Url::parse(base_url).map_err(|e| format!("invalid base url: {e}"))?;
        let http = reqwest::Client::builder()
            .user_agent("lantern-client/0.1")
            .timeout(config::http_timeout())
            .connect_timeout(config::connect_timeout())
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            credential: credential.into(),
            http,
        })
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// `GET active-map` — the full-resync entry point.
    pub async fn fetch_active_map(&self) -> Result<Option<MapEntity>, SyncError> {
        let url = format!("{}/active-map", self.base);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.credential)
            .send()
            .await
            .map_err(|e| SyncError::TransientFetchFailure(format!("request failed: {e}")))?;
        classify_status(resp.status(), "active-map")?;
        let payload: ActiveMapResponse = resp.json().await.map_err(|e| {
            SyncError::TransientFetchFailure(format!("failed to decode active-map payload: {e}"))
        })?;
        Ok(payload.data.active_map)
    }

    pub fn map_image_url(&self, map_id: &str) -> Result<String, String> {
        let mut url = reqwest::Url::parse(&format!("{}/map/{map_id}/map", self.base))
            .map_err(|e| format!("invalid map image url: {e}"))?;
        url.query_pairs_mut()
            .append_pair("authorization", &self.credential);
        Ok(url.into())
    }

    /// Fog names a mutable resource at a stable path, so every URL gets a
    /// fresh cache-defeating suffix.
    pub fn fog_image_url(&self, map_id: &str) -> Result<String, String> {
        let mut url = reqwest::Url::parse(&format!("{}/map/{map_id}/fog-live", self.base))
            .map_err(|e| format!("invalid fog image url: {e}"))?;
        url.query_pairs_mut()
            .append_pair("cache_buster", &cache_buster())
            .append_pair("authorization", &self.credential);
        Ok(url.into())
    }

    /// `PATCH` one token's changed fields. Fire-and-forget from the engine's
    /// perspective; the optimistic local state is already applied.
    pub async fn patch_token(
        &self,
        map_id: &str,
        token_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), SyncError> {
        let url = format!("{}/map/{map_id}/token/{token_id}", self.base);
        let resp = self
            .http
            .patch(&url)
            .bearer_auth(&self.credential)
            .json(fields)
            .send()
            .await
            .map_err(|e| SyncError::TransientFetchFailure(format!("request failed: {e}")))?;
        classify_status(resp.status(), "token patch")
    }
}

fn cache_buster() -> String {
    format!(
        "{}_{}",
        chrono::Utc::now().timestamp_millis(),
        uuid::Uuid::new_v4()
    )
}

fn classify_status(status: StatusCode, context: &str) -> Result<(), SyncError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(SyncError::AuthRequired);
    }
    if !status.is_success() {
        return Err(SyncError::TransientFetchFailure(format!(
            "{context} returned status {status}"
        )));
    }
    Ok(())
}
