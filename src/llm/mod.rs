//! LLM integration.
//!
//! One provider-agnostic contract ([`LlmProvider`]) with a direct reqwest
//! implementation for the Anthropic Messages API. The worker never sees the
//! provider: it gets a [`GenerationBackend`], which is either a configured
//! [`GenerationClient`] or explicitly unconfigured.

pub mod anthropic;
pub mod client;
pub mod provider;

pub use anthropic::AnthropicProvider;
pub use client::{GenerationClient, GenerationSettings};
pub use provider::*;

use std::sync::Arc;
use std::time::Duration;

use crate::error::LlmError;

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: secrecy::SecretString,
    pub model: String,
    /// Endpoint override; `None` uses the public API.
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let mut provider =
        AnthropicProvider::new(&config.api_key, &config.model, config.max_tokens, config.timeout)?;
    if let Some(url) = &config.base_url {
        provider = provider.with_base_url(url);
    }
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(provider))
}

/// The generation capability handed to the worker.
#[derive(Clone)]
pub enum GenerationBackend {
    Configured(GenerationClient),
    /// No credentials: jobs that need generation are skipped, not failed.
    Unconfigured,
}

impl GenerationBackend {
    pub fn from_config(config: Option<&LlmConfig>) -> Result<Self, LlmError> {
        match config {
            Some(config) => {
                let provider = create_provider(config)?;
                Ok(Self::Configured(GenerationClient::new(
                    provider,
                    GenerationSettings {
                        reply_max_tokens: config.max_tokens,
                        scoring_max_tokens: config.max_tokens,
                        timeout: config.timeout,
                    },
                )))
            }
            None => Ok(Self::Unconfigured),
        }
    }

    pub fn client(&self) -> Result<&GenerationClient, LlmError> {
        match self {
            Self::Configured(client) => Ok(client),
            Self::Unconfigured => Err(LlmError::Unconfigured),
        }
    }

    pub fn is_configured(&self) -> bool {
        matches!(self, Self::Configured(_))
    }
}
