use anyhow::{Context, Result, anyhow};
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

use super::Sink;
use crate::models::EventNotification;

/// Outbound request timeout for webhook deliveries
const REQUEST_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct WebhookSinkConfig {
    pub endpoint: String,
    /// Optional shared secret used to sign payloads
    pub secret: Option<String>,
}

/// POSTs the JSON notification to a configured endpoint, optionally
/// signing the body so receivers can verify the origin.
pub struct WebhookSink {
    config: WebhookSinkConfig,
    client: Client,
}

impl WebhookSink {
    pub fn new(config: WebhookSinkConfig) -> Result<Self> {
        if config.endpoint.is_empty() {
            return Err(anyhow!("webhook endpoint is required"));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self { config, client })
    }

    fn signature(&self, payload: &str) -> Option<String> {
        self.config.secret.as_ref().map(|secret| {
            let mut hasher = Sha256::new();
            hasher.update(secret.as_bytes());
            hasher.update(payload.as_bytes());
            format!("sha256={}", hex::encode(hasher.finalize()))
        })
    }
}

#[async_trait::async_trait]
impl Sink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, notification: &EventNotification) -> Result<()> {
        let body =
            serde_json::to_string(notification).context("failed to serialize notification")?;

        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header("Content-Type", "application/json");

        if let Some(signature) = self.signature(&body) {
            request = request.header("X-Quilla-Signature", signature);
        }

        let response = request.body(body).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "webhook endpoint returned status {}",
                response.status()
            ));
        }

        debug!(
            "notification {:?} posted to {}",
            notification.name, self.config.endpoint
        );
        Ok(())
    }
}
