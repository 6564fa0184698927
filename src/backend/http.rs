//! HTTP backend client built on a shared `reqwest::Client`.

use crate::backend::{Backend, ByteStream};
use crate::config::BackendConfig;
use crate::defaults;
use crate::error::{Result, VoxpipeError};
use async_trait::async_trait;
use futures::TryStreamExt;

/// Posts JSON to a fixed endpoint and exposes the response body as a byte
/// stream. The client is shared and read-mostly; no per-request locking.
pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: String,
    health_url: String,
}

impl HttpBackend {
    /// Builds a client with the bounded timeouts from `config`.
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| VoxpipeError::Backend {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            health_url: config.health_url().to_string(),
        })
    }

    /// The endpoint this backend posts to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn send(&self, user: &str, body: serde_json::Value) -> Result<ByteStream> {
        log::debug!("posting request for {} to {}", user, self.endpoint);
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoxpipeError::Backend {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(VoxpipeError::BackendStatus {
                status: status.as_u16(),
                message,
            });
        }

        let stream = response.bytes_stream().map_err(|e| VoxpipeError::Backend {
            message: e.to_string(),
        });
        Ok(Box::pin(stream))
    }

    async fn alive(&self) -> bool {
        let probe = self
            .client
            .get(&self.health_url)
            .timeout(defaults::HEARTBEAT_TIMEOUT)
            .send();
        match probe.await {
            Ok(response) => !response.status().is_server_error(),
            Err(_) => false,
        }
    }
}
