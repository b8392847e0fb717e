//! Error types for the setter pipeline.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Another writer appended to the turn log (or closed the conversation)
    /// since it was read.
    #[error("Concurrent modification of conversation {conversation_id} (expected {expected_len} turns)")]
    ConcurrentModification {
        conversation_id: Uuid,
        expected_len: usize,
    },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Webhook gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Webhook handshake rejected")]
    HandshakeRejected,

    #[error("Webhook signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("Failed to enqueue inbound message: {0}")]
    Enqueue(#[from] DatabaseError),
}

/// Generation backend errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Generation backend is not configured")]
    Unconfigured,

    #[error("Provider {provider} unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("Provider {provider} rejected the request ({status}): {reason}")]
    Rejected {
        provider: String,
        status: u16,
        reason: String,
    },

    #[error("Malformed response from {provider}: {reason}")]
    Malformed { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },
}

impl LlmError {
    /// Whether the queue should re-attempt the job that hit this error.
    ///
    /// Malformed output is retryable here because a second reply generation may
    /// well be parseable; qualification handles `Malformed` itself.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Unconfigured)
    }
}

/// Reply dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No access credential configured for {platform}")]
    MissingCredential { platform: String },

    #[error("Dispatch to {platform} failed ({status}): {reason}")]
    Failed {
        platform: String,
        status: u16,
        reason: String,
    },

    #[error("Dispatch to {platform} failed: {reason}")]
    Transport { platform: String, reason: String },

    #[error("Dispatch to {platform} timed out after {timeout:?}")]
    Timeout { platform: String, timeout: Duration },
}

/// Job processing errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} has an invalid payload: {reason}")]
    InvalidPayload { id: Uuid, reason: String },

    #[error("Conversation {id} not found")]
    ConversationNotFound { id: Uuid },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl JobError {
    /// Whether the queue's retry policy applies, as opposed to dead-lettering
    /// the job straight away.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidPayload { .. } | Self::ConversationNotFound { .. } => false,
            Self::Llm(e) => e.is_retryable(),
            Self::Database(DatabaseError::Constraint(_)) => false,
            Self::Database(_) => true,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_are_retryable_except_unconfigured() {
        let unavailable = LlmError::Unavailable {
            provider: "anthropic".into(),
            reason: "connection refused".into(),
        };
        let malformed = LlmError::Malformed {
            provider: "anthropic".into(),
            reason: "empty content".into(),
        };
        assert!(unavailable.is_retryable());
        assert!(malformed.is_retryable());
        assert!(!LlmError::Unconfigured.is_retryable());
    }

    #[test]
    fn invalid_payload_goes_straight_to_dead_letter() {
        let err = JobError::InvalidPayload {
            id: Uuid::new_v4(),
            reason: "missing text".into(),
        };
        assert!(!err.is_retryable());

        let conflict = JobError::Database(DatabaseError::ConcurrentModification {
            conversation_id: Uuid::new_v4(),
            expected_len: 4,
        });
        assert!(conflict.is_retryable());

        let invariant = JobError::Database(DatabaseError::Constraint(
            "append_turns_and_activate: turn role out of turn".into(),
        ));
        assert!(!invariant.is_retryable());
    }
}
