//! HTTP client for the WhatsApp session bridge.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::gateway::Gateway;

/// Gateway client that posts sends to the bridge's REST API.
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    timeout: Duration,
}

/// Bridge response for a send call.
#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout,
        })
    }

    fn send_url(&self, instance_id: &str) -> String {
        format!("{}/message/sendText/{instance_id}", self.base_url)
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn send_text(
        &self,
        instance_id: &str,
        phone: &str,
        text: &str,
    ) -> Result<(), GatewayError> {
        let body = serde_json::json!({
            "number": phone,
            "text": text,
        });

        let resp = self
            .client
            .post(self.send_url(instance_id))
            .header("apikey", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout {
                        timeout: self.timeout,
                    }
                } else {
                    GatewayError::Http(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        // The bridge can return 200 with an application-level failure
        let parsed: SendResponse = resp.json().await.unwrap_or(SendResponse {
            success: true,
            error: None,
        });
        if !parsed.success {
            return Err(GatewayError::SendFailed {
                phone: phone.to_string(),
                reason: parsed
                    .error
                    .unwrap_or_else(|| "bridge reported failure".to_string()),
            });
        }

        Ok(())
    }
}
