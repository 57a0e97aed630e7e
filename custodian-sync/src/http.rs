//! HTTP transport to the remote authority.
//!
//! Reports are POSTed as JSON to `/api/devices/{id}/heartbeat/`; the response
//! body is the [`Directive`]. Deactivation confirmations go to
//! `/api/devices/{id}/deactivation/confirm/`.

use crate::error::{SyncError, SyncResult};
use crate::identity::DeviceIdentity;
use crate::transport::{DeactivationReport, RemoteClient};
use async_trait::async_trait;
use custodian_types::{Directive, StateSnapshot};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Connection settings for the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// e.g. `https://authority.example.com`
    pub base_url: String,
    /// Per-device credential, sent in `api_key_header`.
    pub api_key: Option<String>,
    pub api_key_header: String,
    pub request_timeout_secs: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            api_key: None,
            api_key_header: "X-Device-Api-Key".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Serialize)]
struct HeartbeatRequest<'a> {
    device_id: &'a str,
    retry_count: u32,
    snapshot: &'a StateSnapshot,
}

pub struct HttpRemoteClient {
    config: HttpClientConfig,
    client: Client,
}

impl HttpRemoteClient {
    pub fn new(config: HttpClientConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SyncError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn device_url(&self, identity: &DeviceIdentity, suffix: &str) -> String {
        format!(
            "{}/api/devices/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            urlencoding::encode(&identity.id),
            suffix
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.header(self.config.api_key_header.as_str(), key),
            None => request,
        }
    }

    async fn execute(&self, request: RequestBuilder) -> SyncResult<Response> {
        let response = self.authorize(request).send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::Timeout
            } else {
                SyncError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                SyncError::Auth(format!("{status}: {body}"))
            }
            s if s.is_server_error() => SyncError::Network(format!("server error {status}: {body}")),
            _ => SyncError::Protocol(format!("unexpected status {status}: {body}")),
        })
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn send(
        &self,
        identity: &DeviceIdentity,
        snapshot: &StateSnapshot,
        retry_count: u32,
    ) -> SyncResult<Directive> {
        let url = self.device_url(identity, "heartbeat/");
        debug!(%url, retry_count, "sending heartbeat");

        let request = self.client.post(&url).json(&HeartbeatRequest {
            device_id: &identity.id,
            retry_count,
            snapshot,
        });
        let response = self.execute(request).await?;
        response
            .json::<Directive>()
            .await
            .map_err(|e| SyncError::Protocol(format!("invalid directive: {e}")))
    }

    async fn confirm_deactivation(
        &self,
        identity: &DeviceIdentity,
        report: &DeactivationReport,
    ) -> SyncResult<()> {
        let url = self.device_url(identity, "deactivation/confirm/");
        debug!(%url, status = ?report.status, "confirming deactivation");
        self.execute(self.client.post(&url).json(report)).await?;
        Ok(())
    }
}
