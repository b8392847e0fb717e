//! Anthropic Messages API provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, MessageRole,
};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const PROVIDER: &str = "anthropic";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    id: Option<String>,
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(rename = "type")]
    type_: String,
    message: String,
}

/// Direct HTTP client for the Messages API.
pub struct AnthropicProvider {
    client: reqwest::Client,
    model: String,
    base_url: String,
    default_max_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(
        api_key: &SecretString,
        model: impl Into<String>,
        default_max_tokens: u32,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let mut headers = HeaderMap::new();
        let mut key = HeaderValue::from_str(api_key.expose_secret()).map_err(|e| {
            LlmError::Unavailable {
                provider: PROVIDER.into(),
                reason: format!("invalid API key header value: {e}"),
            }
        })?;
        key.set_sensitive(true);
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Unavailable {
                provider: PROVIDER.into(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_max_tokens,
        })
    }

    /// Overrides the endpoint URL (for proxies and wiremock tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

/// System messages become the top-level `system` field; consecutive messages
/// of the same role are merged, since the API requires alternation.
fn build_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<ApiMessage<'static>>) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == MessageRole::System)
        .map(|m| m.content.as_str())
        .collect();
    let system = (!system.is_empty()).then(|| system.join("\n\n"));

    let mut out: Vec<ApiMessage<'static>> = Vec::new();
    for m in messages.iter().filter(|m| m.role != MessageRole::System) {
        let role = match m.role {
            MessageRole::Assistant => "assistant",
            _ => "user",
        };
        match out.last_mut() {
            Some(last) if last.role == role => {
                last.content.push_str("\n\n");
                last.content.push_str(&m.content);
            }
            _ => out.push(ApiMessage {
                role,
                content: m.content.clone(),
            }),
        }
    }
    (system, out)
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (system, messages) = build_messages(&request.messages);
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: request.max_tokens.unwrap_or(self.default_max_tokens),
            system,
            messages,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(&self.base_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Unavailable {
                provider: PROVIDER.into(),
                reason: format!("HTTP request failed: {e}"),
            })?;

        let status = response.status();
        debug!(status = %status, model = %self.model, "Completion response received");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = match serde_json::from_str::<ApiErrorResponse>(&body) {
                Ok(api_err) => format!("{}: {}", api_err.error.type_, api_err.error.message),
                Err(_) => body,
            };
            return Err(LlmError::Rejected {
                provider: PROVIDER.into(),
                status: status.as_u16(),
                reason,
            });
        }

        let body = response.text().await.map_err(|e| LlmError::Unavailable {
            provider: PROVIDER.into(),
            reason: format!("failed to read response body: {e}"),
        })?;
        let parsed: MessagesResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::Malformed {
                provider: PROVIDER.into(),
                reason: format!("failed to parse API response: {e}"),
            })?;

        let content: String = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        let finish_reason = match parsed.stop_reason.as_deref() {
            Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
            Some("max_tokens") => FinishReason::Length,
            _ => FinishReason::Unknown,
        };
        let usage = parsed.usage.unwrap_or_default();

        Ok(CompletionResponse {
            content,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            finish_reason,
            response_id: parsed.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> AnthropicProvider {
        AnthropicProvider::new(
            &SecretString::from("test-api-key"),
            "claude-test",
            1024,
            Duration::from_secs(5),
        )
        .unwrap()
        .with_base_url(format!("{}/v1/messages", server.uri()))
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![
            ChatMessage::system("You are a setter."),
            ChatMessage::user("Hi"),
        ])
    }

    #[tokio::test]
    async fn sends_headers_and_system_prompt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-api-key"))
            .and(header("anthropic-version", "2023-06-01"))
            .and(body_partial_json(serde_json::json!({
                "model": "claude-test",
                "max_tokens": 1024,
                "system": "You are a setter.",
                "messages": [{"role": "user", "content": "Hi"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "content": [{"type": "text", "text": "Hello! What brings you here?"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 12, "output_tokens": 7}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = provider(&server).complete(request()).await.unwrap();
        assert_eq!(response.content, "Hello! What brings you here?");
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.output_tokens, 7);
    }

    #[tokio::test]
    async fn non_success_is_rejected_with_api_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(529).set_body_json(serde_json::json!({
                "error": {"type": "overloaded_error", "message": "Overloaded"}
            })))
            .mount(&server)
            .await;

        let err = provider(&server).complete(request()).await.unwrap_err();
        match err {
            LlmError::Rejected { status, reason, .. } => {
                assert_eq!(status, 529);
                assert!(reason.contains("overloaded_error"), "got: {reason}");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = provider(&server).complete(request()).await.unwrap_err();
        assert!(matches!(err, LlmError::Malformed { .. }));
    }

    #[tokio::test]
    async fn slow_backend_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new(
            &SecretString::from("k"),
            "claude-test",
            1024,
            Duration::from_millis(100),
        )
        .unwrap()
        .with_base_url(server.uri());
        let err = provider.complete(request()).await.unwrap_err();
        assert!(matches!(err, LlmError::Unavailable { .. }));
    }

    #[test]
    fn merges_consecutive_roles() {
        let (system, messages) = build_messages(&[
            ChatMessage::system("a"),
            ChatMessage::user("one"),
            ChatMessage::user("two"),
            ChatMessage::assistant("three"),
        ]);
        assert_eq!(system.as_deref(), Some("a"));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "one\n\ntwo");
        assert_eq!(messages[1].role, "assistant");
    }
}
