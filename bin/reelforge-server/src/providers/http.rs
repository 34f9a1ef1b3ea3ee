//! JSON-over-HTTP adapters for the core's collaborator traits.
//!
//! Every adapter speaks the same small protocol with bearer auth:
//!
//! | Call | Request |
//! |---|---|
//! | submit | `POST {base}/tasks` with the task input, answers `{"id": ...}` |
//! | status | `GET {base}/tasks/{id}`, answers a status report |
//! | cancel | `POST {base}/tasks/{id}/cancel` |
//! | relocate | `PUT {base}/assets/{file_name}` with the file bytes, answers `{"url": ...}` |
//! | create group | `POST {base}/groups` |
//! | add looks | `POST {base}/groups/{id}/looks`, answers `{"look_ids": [...]}` |
//!
//! Connection failures, 429 and 5xx are transient; any other non-success
//! status is a rejection carrying the provider's message.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reelforge_core::{
    AssetRelocator, AvatarGroup, AvatarGroups, ProviderClient, ProviderError, StatusReport,
    TaskInput,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use crate::config::Endpoint;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared client plumbing for one endpoint.
#[derive(Debug, Clone)]
struct Api {
    name: &'static str,
    endpoint: Endpoint,
    client: Client,
}

impl Api {
    fn new(name: &'static str, endpoint: Endpoint) -> Self {
        let client = Client::builder()
            .user_agent(concat!("reelforge-server/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            name,
            endpoint,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint.base_url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ProviderError> {
        let response = request
            .bearer_auth(&self.endpoint.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("{}: {e}", self.name)))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(self.name, status, &body))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, ProviderError> {
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| {
                ProviderError::Transient(format!("{}: malformed response: {e}", self.name))
            })
    }
}

/// Map a non-success HTTP status to the provider error taxonomy.
fn classify(name: &str, status: StatusCode, body: &str) -> ProviderError {
    let message = provider_message(body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_owned()
    });
    let message = format!("{name}: {message} ({})", status.as_u16());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::Transient(message)
    } else {
        ProviderError::Rejected(message)
    }
}

/// `{"error": "..."}`, `{"error": {"message": "..."}}` or `{"message": "..."}`.
fn provider_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let text = value
        .get("error")
        .and_then(|e| e.as_str().or_else(|| e.get("message").and_then(|m| m.as_str())))
        .or_else(|| value.get("message").and_then(|m| m.as_str()))?;
    Some(text.to_owned())
}

// ── ProviderClient ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SubmitResponse {
    id: String,
}

/// Generation provider for one task kind.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    api: Api,
}

impl HttpProvider {
    pub fn new(name: &'static str, endpoint: Endpoint) -> Self {
        Self {
            api: Api::new(name, endpoint),
        }
    }
}

#[async_trait]
impl ProviderClient for HttpProvider {
    async fn submit(&self, input: &TaskInput) -> Result<String, ProviderError> {
        let request = self.api.client.post(self.api.url("/tasks")).json(input);
        let SubmitResponse { id } = self.api.send_json(request).await?;
        debug!(provider = self.api.name, %id, "task accepted");
        Ok(id)
    }

    async fn check_status(&self, provider_task_id: &str) -> Result<StatusReport, ProviderError> {
        let request = self
            .api
            .client
            .get(self.api.url(&format!("/tasks/{provider_task_id}")));
        self.api.send_json(request).await
    }

    async fn cancel(&self, provider_task_id: &str) -> Result<(), ProviderError> {
        let request = self
            .api
            .client
            .post(self.api.url(&format!("/tasks/{provider_task_id}/cancel")));
        self.api.send(request).await.map(|_| ())
    }
}

// ── AssetRelocator ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct UploadResponse {
    url: String,
}

/// Uploads local files to the asset host.
#[derive(Debug, Clone)]
pub struct HttpRelocator {
    api: Api,
}

impl HttpRelocator {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            api: Api::new("assets", endpoint),
        }
    }
}

#[async_trait]
impl AssetRelocator for HttpRelocator {
    async fn ensure_publicly_reachable(&self, local_ref: &str) -> Result<String, ProviderError> {
        if local_ref.starts_with("https://") || local_ref.starts_with("http://") {
            return Ok(local_ref.to_owned());
        }
        let path = Path::new(local_ref);
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ProviderError::Rejected(format!("not a file path: {local_ref}")))?
            .to_owned();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ProviderError::Rejected(format!("cannot read {local_ref}: {e}")))?;

        let request = self
            .api
            .client
            .put(self.api.url(&format!("/assets/{file_name}")))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes);
        let UploadResponse { url } = self.api.send_json(request).await?;
        debug!(%local_ref, %url, "asset relocated");
        Ok(url)
    }
}

// ── AvatarGroups ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LooksResponse {
    look_ids: Vec<String>,
}

/// Avatar group management on the avatar provider.
#[derive(Debug, Clone)]
pub struct HttpAvatarGroups {
    api: Api,
}

impl HttpAvatarGroups {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            api: Api::new("avatar", endpoint),
        }
    }
}

#[async_trait]
impl AvatarGroups for HttpAvatarGroups {
    async fn create_group(
        &self,
        name: &str,
        first_asset: &str,
    ) -> Result<AvatarGroup, ProviderError> {
        let request = self
            .api
            .client
            .post(self.api.url("/groups"))
            .json(&json!({ "name": name, "asset_url": first_asset }));
        self.api.send_json(request).await
    }

    async fn add_looks(
        &self,
        group_id: &str,
        assets: &[String],
    ) -> Result<Vec<String>, ProviderError> {
        let request = self
            .api
            .client
            .post(self.api.url(&format!("/groups/{group_id}/looks")))
            .json(&json!({ "asset_urls": assets }));
        let LooksResponse { look_ids } = self.api.send_json(request).await?;
        if look_ids.len() != assets.len() {
            return Err(ProviderError::Rejected(format!(
                "avatar: expected {} looks, got {}",
                assets.len(),
                look_ids.len()
            )));
        }
        Ok(look_ids)
    }
}
