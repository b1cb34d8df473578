//! HTTP implementation of [`RemoteGateway`] over the Jotter REST API.

use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde::Deserialize;

use super::gateway::{entry_id_of, GatewayError, GatewayResult, RemoteEntity, RemoteGateway, RemoteId};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::models::{EntityRef, Entry, EntryId};
use crate::util::{compact_text, is_http_url, normalize_text_option};

/// Request timeout applied to every call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

impl From<reqwest::Error> for GatewayError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::InvalidPayload(error.to_string())
        } else {
            Self::Network(error.to_string())
        }
    }
}

#[derive(Clone)]
pub struct HttpGateway {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpGateway {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpGateway")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let token = normalize_text_option(Some(token.into()))
            .ok_or_else(|| Error::InvalidInput("API token must not be empty".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|error| Error::Sync(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            base_url,
            token,
            client,
        })
    }

    /// Build a gateway from a complete [`SyncConfig`].
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        match (&config.api_base_url, &config.auth_token) {
            (Some(url), Some(token)) => Self::new(url.as_str(), token.as_str()),
            _ => Err(Error::InvalidInput(
                "remote sync requires both an API URL and a token".to_string(),
            )),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn entry_url(&self, id: &EntryId) -> String {
        format!("{}/v1/entries/{id}", self.base_url)
    }

    fn changes_url(&self) -> String {
        format!("{}/v1/entries/changes", self.base_url)
    }

    async fn failure(response: Response) -> GatewayError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_failure(status, &body)
    }
}

#[derive(Debug, Deserialize)]
struct UpsertResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    #[serde(default)]
    changes: Vec<RemoteEntity>,
}

impl RemoteGateway for HttpGateway {
    async fn create_or_update(&self, entry: &Entry, base: Option<i64>) -> GatewayResult<RemoteId> {
        let mut request = self
            .client
            .put(self.entry_url(&entry.id))
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .json(entry);
        if let Some(base) = base {
            request = request.query(&[("base", base)]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Self::failure(response).await);
        }

        let payload = response.json::<UpsertResponse>().await?;
        Ok(RemoteId(payload.id))
    }

    async fn delete(&self, entity: &EntityRef, base: Option<i64>) -> GatewayResult<()> {
        let id = entry_id_of(entity)?;
        let mut request = self.client.delete(self.entry_url(&id)).bearer_auth(&self.token);
        if let Some(base) = base {
            request = request.query(&[("base", base)]);
        }

        let response = request.send().await?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Self::failure(response).await)
    }

    async fn fetch_changes(&self, since: Option<i64>) -> GatewayResult<Vec<RemoteEntity>> {
        let mut request = self
            .client
            .get(self.changes_url())
            .bearer_auth(&self.token)
            .header("Accept", "application/json");
        if let Some(since) = since {
            request = request.query(&[("since", since)]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Self::failure(response).await);
        }

        let payload = response.json::<ChangesResponse>().await?;
        tracing::debug!("Fetched {} remote changes", payload.changes.len());
        Ok(payload.changes)
    }

    async fn fetch(&self, entity: &EntityRef) -> GatewayResult<Option<RemoteEntity>> {
        let id = entry_id_of(entity)?;
        let response = self
            .client
            .get(self.entry_url(&id))
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::failure(response).await);
        }

        Ok(Some(response.json::<RemoteEntity>().await?))
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return compact_text(&message);
        }
    }

    let compact = compact_text(body);
    if compact.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        compact
    }
}

fn classify_failure(status: StatusCode, body: &str) -> GatewayError {
    let message = parse_api_error(status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Unauthorized(message),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => GatewayError::Conflict(message),
        _ => GatewayError::Rejected {
            status: status.as_u16(),
            message,
        },
    }
}

fn normalize_base_url(raw: String) -> Result<String> {
    let url = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::InvalidInput("API URL must not be empty".to_string()))?;
    if is_http_url(&url) {
        Ok(url.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "API URL must include http:// or https://".to_string(),
        ))
    }
}
