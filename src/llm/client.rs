//! Reply generation and qualification scoring on top of an [`LlmProvider`].
//!
//! Owns prompt construction, the per-call timeout, and response parsing.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::agent_config::QualificationCriteria;
use crate::conversation::{Role, Turn};
use crate::error::LlmError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::qualification::ScoreReport;

/// Tuning for generation calls.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub reply_max_tokens: u32,
    pub scoring_max_tokens: u32,
    /// Upper bound on every backend call.
    pub timeout: Duration,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            reply_max_tokens: 1024,
            scoring_max_tokens: 1024,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Client the worker talks to.
#[derive(Clone)]
pub struct GenerationClient {
    llm: Arc<dyn LlmProvider>,
    settings: GenerationSettings,
}

impl GenerationClient {
    pub fn new(llm: Arc<dyn LlmProvider>, settings: GenerationSettings) -> Self {
        Self { llm, settings }
    }

    pub fn provider_name(&self) -> &str {
        self.llm.model_name()
    }

    /// Produce the agent's next reply.
    pub async fn generate_reply(
        &self,
        system_prompt: &str,
        history: &[Turn],
        new_message: &str,
    ) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend(history.iter().map(ChatMessage::from));
        messages.push(ChatMessage::user(new_message));

        let request =
            CompletionRequest::new(messages).with_max_tokens(self.settings.reply_max_tokens);
        let response = self.call(request).await?;

        let reply = response.trim();
        if reply.is_empty() {
            return Err(LlmError::Malformed {
                provider: self.provider_name().to_string(),
                reason: "empty reply".into(),
            });
        }
        Ok(reply.to_string())
    }

    /// Ask the backend to score a conversation. The range of the returned
    /// score is not checked here.
    pub async fn score_qualification(
        &self,
        history: &[Turn],
        criteria: &QualificationCriteria,
    ) -> Result<ScoreReport, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(SCORING_SYSTEM_PROMPT),
            ChatMessage::user(build_scoring_prompt(history, criteria)),
        ])
        .with_temperature(0.0)
        .with_max_tokens(self.settings.scoring_max_tokens);

        let response = self.call(request).await?;
        let json = extract_json_object(&response).ok_or_else(|| {
            warn!(provider = self.provider_name(), "No JSON object in qualification response");
            LlmError::Malformed {
                provider: self.provider_name().to_string(),
                reason: "no JSON object in qualification response".into(),
            }
        })?;

        serde_json::from_str::<ScoreReport>(json).map_err(|e| LlmError::Malformed {
            provider: self.provider_name().to_string(),
            reason: format!("invalid qualification JSON: {e}"),
        })
    }

    async fn call(&self, request: CompletionRequest) -> Result<String, LlmError> {
        let timeout = self.settings.timeout;
        match tokio::time::timeout(timeout, self.llm.complete(request)).await {
            Ok(Ok(response)) => {
                debug!(
                    provider = self.provider_name(),
                    input_tokens = response.input_tokens,
                    output_tokens = response.output_tokens,
                    "Generation call finished"
                );
                Ok(response.content)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LlmError::Timeout {
                provider: self.provider_name().to_string(),
                timeout,
            }),
        }
    }
}

const SCORING_SYSTEM_PROMPT: &str = "You evaluate sales conversations and answer with a single JSON object only.";

fn build_scoring_prompt(history: &[Turn], criteria: &QualificationCriteria) -> String {
    let transcript = history
        .iter()
        .map(|t| {
            let who = match t.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            format!("{who}: {}", t.content)
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Analyse this conversation and decide whether the lead is qualified.\n\n\
         Qualification criteria:\n{description}\n\
         Minimum score to qualify: {min_score}/10\n\n\
         Conversation:\n{transcript}\n\n\
         Reply ONLY with valid JSON in this format:\n\
         {{\n  \"isQualified\": true,\n  \"score\": 0,\n  \"extractedInfo\": {{\n    \
         \"name\": \"...\",\n    \"email\": \"...\",\n    \"phone\": \"...\",\n    \
         \"budget\": \"...\",\n    \"motivation\": \"...\",\n    \"timeline\": \"...\",\n    \
         \"painPoints\": [\"...\"]\n  }},\n  \"reasoning\": \"short explanation\",\n  \
         \"nextSteps\": \"recommended next action\"\n}}\n\
         The score is a number from 0 to 10.",
        description = if criteria.description.is_empty() {
            "(none given)"
        } else {
            criteria.description.as_str()
        },
        min_score = criteria.min_score(),
    )
}

/// Pull a JSON object out of model output: bare, fenced in a markdown block,
/// or embedded in prose.
fn extract_json_object(text: &str) -> Option<&str> {
    let trimmed = text.trim();

    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed);
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return Some(inner);
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}
