//! Supabase Storage backend
//!
//! Talks to the Storage REST API directly: a bucket listing is the
//! authoritative existence check, the public object URL is the artifact
//! location, and uploads are sent with `x-upsert: true` so regeneration
//! overwrites in place.

use super::{ArtifactLocation, ArtifactStore, Presence};
use crate::{ArtifactKey, StoreConfig, StoreError};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const LIST_LIMIT: u32 = 1;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

static HTTP_CLIENT: OnceCell<reqwest::Client> = OnceCell::new();

/// Process-wide client, built on first use and shared read-only afterwards.
fn http_client() -> Result<&'static reqwest::Client, StoreError> {
    HTTP_CLIENT.get_or_try_init(|| {
        reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("screenshot-cache/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StoreError::Misconfigured(format!("cannot build HTTP client: {e}")))
    })
}

#[derive(Debug, Serialize)]
struct ListRequest<'a> {
    prefix: &'a str,
    search: &'a str,
    limit: u32,
    offset: u32,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "statusCode")]
    status_code: Option<serde_json::Value>,
    error: Option<String>,
    message: Option<String>,
}

impl ErrorBody {
    /// Storage reports RLS and JWT failures as HTTP 400 with the real code in the body.
    fn status_code(&self) -> Option<u16> {
        match self.status_code.as_ref()? {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            _ => None,
        }
    }
}

fn classify_failure(status: StatusCode, body: &str) -> StoreError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let effective = parsed
        .as_ref()
        .and_then(ErrorBody::status_code)
        .unwrap_or_else(|| status.as_u16());
    let message = parsed
        .and_then(|b| b.message.or(b.error))
        .unwrap_or_else(|| body.trim().to_string());

    match effective {
        401 | 403 => StoreError::Unauthorized {
            status: effective,
            message,
        },
        _ => StoreError::Rejected {
            status: status.as_u16(),
            message,
        },
    }
}

#[derive(Debug, Clone)]
pub struct SupabaseStore {
    base_url: String,
    bucket: String,
    folder: String,
    api_key: String,
}

impl SupabaseStore {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| StoreError::Misconfigured("store base URL is not set".to_string()))?;
        url::Url::parse(base_url)
            .map_err(|e| StoreError::Misconfigured(format!("invalid store base URL: {e}")))?;

        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| StoreError::Misconfigured("store API key is not set".to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            folder: config.prefix.trim_matches('/').to_string(),
            api_key,
        })
    }

    fn object_path(&self, key: &ArtifactKey) -> String {
        if self.folder.is_empty() {
            key.object_name()
        } else {
            format!("{}/{}", self.folder, key.object_name())
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .bearer_auth(&self.api_key)
            .header("apikey", &self.api_key)
    }
}

#[async_trait]
impl ArtifactStore for SupabaseStore {
    async fn exists(&self, key: &ArtifactKey) -> Result<Presence, StoreError> {
        let client = http_client()?;
        let name = key.object_name();
        let url = format!("{}/storage/v1/object/list/{}", self.base_url, self.bucket);
        let body = ListRequest {
            prefix: &self.folder,
            search: &name,
            limit: LIST_LIMIT,
            offset: 0,
        };

        let response = match self.authorized(client.post(&url)).json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(key = %key, "Existence check failed, treating as miss: {}", e);
                return Ok(Presence::Inconclusive);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = classify_failure(status, &text);
            if err.is_auth_failure() {
                return Err(err);
            }
            warn!(key = %key, "Existence check rejected, treating as miss: {}", err);
            return Ok(Presence::Inconclusive);
        }

        let entries: Vec<ListEntry> = match response.json().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(key = %key, "Unreadable bucket listing, treating as miss: {}", e);
                return Ok(Presence::Inconclusive);
            }
        };

        let found = entries.iter().any(|entry| entry.name == name);
        debug!(key = %key, found, "Bucket listing checked");

        Ok(if found {
            Presence::Present
        } else {
            Presence::Absent
        })
    }

    fn resolve(&self, key: &ArtifactKey) -> ArtifactLocation {
        ArtifactLocation::new(format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url,
            self.bucket,
            self.object_path(key)
        ))
    }

    async fn write(
        &self,
        key: &ArtifactKey,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<ArtifactLocation, StoreError> {
        let client = http_client()?;
        let path = self.object_path(key);
        let url = format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, path);
        let size = bytes.len();

        let response = self
            .authorized(client.post(&url))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &text));
        }

        debug!(key = %key, path = %path, size, "Artifact uploaded");
        Ok(self.resolve(key))
    }
}
