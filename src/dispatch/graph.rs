//! Meta Graph API send for Messenger and Instagram.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info};

use crate::conversation::Platform;
use crate::dispatch::{MAX_MESSAGE_CHARS, ReplyDispatcher, split_message};
use crate::error::DispatchError;

/// Where and how to reach the Graph API.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub base_url: String,
    pub api_version: String,
    pub timeout: Duration,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.facebook.com".to_string(),
            api_version: "v18.0".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphErrorResponse {
    error: GraphErrorBody,
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    message: String,
    #[serde(default)]
    code: Option<i64>,
}

/// Sends replies through `POST /{version}/me/messages`.
pub struct GraphApiDispatcher {
    client: reqwest::Client,
    config: GraphConfig,
}

impl GraphApiDispatcher {
    pub fn new(config: GraphConfig) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DispatchError::Transport {
                platform: "graph".into(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, config })
    }

    fn api_url(&self) -> String {
        format!(
            "{}/{}/me/messages",
            self.config.base_url.trim_end_matches('/'),
            self.config.api_version
        )
    }

    async fn send_chunk(
        &self,
        platform: Platform,
        recipient_id: &str,
        text: &str,
        token: &SecretString,
    ) -> Result<(), DispatchError> {
        let body = serde_json::json!({
            "recipient": { "id": recipient_id },
            "message": { "text": text },
            "messaging_type": "RESPONSE",
        });

        let response = self
            .client
            .post(self.api_url())
            .query(&[("access_token", token.expose_secret())])
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchError::Timeout {
                        platform: platform.to_string(),
                        timeout: self.config.timeout,
                    }
                } else {
                    DispatchError::Transport {
                        platform: platform.to_string(),
                        // Strip the URL so the token never reaches logs.
                        reason: e.without_url().to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(platform = %platform, recipient_id, "Reply chunk delivered");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let reason = match serde_json::from_str::<GraphErrorResponse>(&body) {
            Ok(err) => match err.error.code {
                Some(code) => format!("{} (code {code})", err.error.message),
                None => err.error.message,
            },
            Err(_) => body,
        };
        Err(DispatchError::Failed {
            platform: platform.to_string(),
            status: status.as_u16(),
            reason,
        })
    }
}

#[async_trait]
impl ReplyDispatcher for GraphApiDispatcher {
    async fn send(
        &self,
        platform: Platform,
        recipient_id: &str,
        text: &str,
        access_token: Option<&SecretString>,
    ) -> Result<(), DispatchError> {
        if platform == Platform::Test {
            debug!(recipient_id, "Test conversation, reply not sent out");
            return Ok(());
        }

        let token = access_token.ok_or_else(|| DispatchError::MissingCredential {
            platform: platform.to_string(),
        })?;

        let chunks = split_message(text, MAX_MESSAGE_CHARS);
        for chunk in &chunks {
            self.send_chunk(platform, recipient_id, chunk, token).await?;
        }
        info!(platform = %platform, recipient_id, chunks = chunks.len(), "Reply dispatched");
        Ok(())
    }
}
