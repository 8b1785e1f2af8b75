//! Typed wire calls against the remote content service (spec §4.3). No
//! retry logic lives here — retry is the upload queue's job (§4.8); this
//! module only performs the call and classifies failures.

use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use reqwest::{Client as HttpClient, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::errors::SyncError;

#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub username: String,
    #[serde(rename = "serverTime")]
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SiteListing {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    pub filename: String,
    pub path: String,
    pub checksum: String,
    #[serde(rename = "modifiedAt")]
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadResult {
    pub content: String,
    #[serde(rename = "modifiedAt")]
    pub modified_at: DateTime<Utc>,
    pub checksum: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadResult {
    #[serde(rename = "nodeId")]
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize)]
struct UploadRequest<'a> {
    filename: &'a str,
    content: &'a str,
    #[serde(rename = "modifiedAt")]
    modified_at: DateTime<Utc>,
    #[serde(rename = "snapshotHtml", skip_serializing_if = "Option::is_none")]
    snapshot_html: Option<&'a str>,
    #[serde(rename = "senderId", skip_serializing_if = "Option::is_none")]
    sender_id: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadListing {
    pub path: String,
    pub checksum: String,
    #[serde(rename = "modifiedAt")]
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UploadDownloadResult {
    pub content: Vec<u8>,
    pub modified_at: DateTime<Utc>,
    pub checksum: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawUploadDownloadResult {
    content: String,
    #[serde(rename = "modifiedAt")]
    modified_at: DateTime<Utc>,
    checksum: String,
}

/// Client for the single-user content service. Carries `X-API-Key` on
/// every call; holds no mutable session state (unlike the teacher's OAuth
/// token dance — this service authenticates with one static key, so there
/// is nothing to refresh).
#[derive(Clone)]
pub struct ApiClient {
    base: String,
    api_key: String,
    device_id: String,
    http: HttpClient,
}

impl ApiClient {
    pub fn new(base_url: &str, api_key: &str, device_id: &str) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("build http client")?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            device_id: device_id.to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn error_for_response(&self, resp: Response) -> SyncError {
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .unwrap_or_else(|_| serde_json::Value::Null);
        let message = body
            .get("msg")
            .or_else(|| body.get("message"))
            .or_else(|| body.get("error"))
            .and_then(|v| v.as_str())
            .unwrap_or("request failed")
            .to_string();
        let suggestions = body
            .get("details")
            .and_then(|d| d.get("suggestions"))
            .and_then(|s| s.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        SyncError::from_status(status.as_u16(), message, suggestions)
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        let resp = self
            .http
            .get(self.url("/api/status"))
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .context("send status request")?;
        if !resp.status().is_success() {
            return Err(self.error_for_response(resp).await.into());
        }
        resp.json().await.context("parse status response")
    }

    pub async fn list_sites(&self) -> Result<Vec<SiteListing>> {
        let resp = self
            .http
            .get(self.url("/api/sites"))
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .context("send list_sites request")?;
        if !resp.status().is_success() {
            return Err(self.error_for_response(resp).await.into());
        }
        resp.json().await.context("parse list_sites response")
    }

    pub async fn download(&self, path_without_ext: &str) -> Result<DownloadResult> {
        let resp = self
            .http
            .get(self.url(&format!(
                "/api/sites/{}",
                url::form_urlencoded::byte_serialize(path_without_ext.as_bytes()).collect::<String>()
            )))
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .context("send download request")?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(SyncError::new(
                crate::errors::SyncErrorKind::Unknown,
                format!("{path_without_ext} not found on server"),
            )
            .with_status(404)
            .into());
        }
        if !resp.status().is_success() {
            return Err(self.error_for_response(resp).await.into());
        }
        resp.json().await.context("parse download response")
    }

    pub async fn upload(
        &self,
        filename: &str,
        content: &str,
        modified_at: DateTime<Utc>,
        snapshot_html: Option<&str>,
        include_sender: bool,
    ) -> Result<UploadResult> {
        let req = UploadRequest {
            filename,
            content,
            modified_at,
            snapshot_html,
            sender_id: if include_sender {
                Some(self.device_id.as_str())
            } else {
                None
            },
        };
        let resp = self
            .http
            .post(self.url("/api/sites"))
            .header("X-API-Key", &self.api_key)
            .json(&req)
            .send()
            .await
            .context("send upload request")?;
        if !resp.status().is_success() {
            return Err(self.error_for_response(resp).await.into());
        }
        resp.json().await.context("parse upload response")
    }

    pub async fn delete(&self, node_id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url("/api/sites"))
            .header("X-API-Key", &self.api_key)
            .json(&serde_json::json!({ "nodeId": node_id }))
            .send()
            .await
            .context("send delete request")?;
        if !resp.status().is_success() {
            return Err(self.error_for_response(resp).await.into());
        }
        Ok(())
    }

    pub async fn rename(&self, node_id: &str, new_name: &str) -> Result<()> {
        let resp = self
            .http
            .patch(self.url("/api/sites"))
            .header("X-API-Key", &self.api_key)
            .json(&serde_json::json!({ "nodeId": node_id, "newName": new_name }))
            .send()
            .await
            .context("send rename request")?;
        if !resp.status().is_success() {
            return Err(self.error_for_response(resp).await.into());
        }
        Ok(())
    }

    pub async fn move_node(&self, node_id: &str, target_folder_path: &str) -> Result<()> {
        let resp = self
            .http
            .patch(self.url("/api/sites/move"))
            .header("X-API-Key", &self.api_key)
            .json(&serde_json::json!({
                "nodeId": node_id,
                "targetFolderPath": target_folder_path,
            }))
            .send()
            .await
            .context("send move request")?;
        if !resp.status().is_success() {
            return Err(self.error_for_response(resp).await.into());
        }
        Ok(())
    }

    pub async fn list_uploads(&self) -> Result<Vec<UploadListing>> {
        let resp = self
            .http
            .get(self.url("/api/uploads"))
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .context("send list_uploads request")?;
        if !resp.status().is_success() {
            return Err(self.error_for_response(resp).await.into());
        }
        resp.json().await.context("parse list_uploads response")
    }

    pub async fn download_upload(&self, path: &str) -> Result<UploadDownloadResult> {
        let encoded: String = url::form_urlencoded::byte_serialize(path.as_bytes()).collect();
        let resp = self
            .http
            .get(self.url(&format!("/api/uploads/{encoded}")))
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .context("send download_upload request")?;
        if !resp.status().is_success() {
            return Err(self.error_for_response(resp).await.into());
        }
        let raw: RawUploadDownloadResult =
            resp.json().await.context("parse download_upload response")?;
        let content = BASE64
            .decode(raw.content.as_bytes())
            .context("decode upload content")?;
        Ok(UploadDownloadResult {
            content,
            modified_at: raw.modified_at,
            checksum: raw.checksum,
        })
    }

    pub async fn upload_upload(
        &self,
        path: &str,
        content: &[u8],
        modified_at: DateTime<Utc>,
    ) -> Result<()> {
        let encoded = BASE64.encode(content);
        let resp = self
            .http
            .post(self.url("/api/uploads"))
            .header("X-API-Key", &self.api_key)
            .json(&serde_json::json!({
                "path": path,
                "content": encoded,
                "modifiedAt": modified_at,
            }))
            .send()
            .await
            .context("send upload_upload request")?;
        if !resp.status().is_success() {
            return Err(self.error_for_response(resp).await.into());
        }
        Ok(())
    }

    /// Opens the real-time event stream. The returned byte stream carries
    /// raw `text/event-stream` bytes; framing into `data:`/`:` lines is the
    /// SSE client's job (§4.7).
    pub async fn open_stream(&self) -> Result<impl Stream<Item = reqwest::Result<bytes::Bytes>>> {
        let resp = self
            .http
            .get(self.url("/sync/stream"))
            .header("X-API-Key", &self.api_key)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .context("open event stream")?;
        if !resp.status().is_success() {
            return Err(self.error_for_response(resp).await.into());
        }
        Ok(resp.bytes_stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_trims_trailing_slash_from_base() {
        let client = ApiClient::new("https://example.test/", "key", "dev-1").unwrap();
        assert_eq!(client.url("/api/status"), "https://example.test/api/status");
    }

    #[test]
    fn device_id_is_exposed_for_echo_suppression() {
        let client = ApiClient::new("https://example.test", "key", "dev-42").unwrap();
        assert_eq!(client.device_id(), "dev-42");
    }
}
