//! Reply dispatch back to the messaging platform.

pub mod graph;

pub use graph::{GraphApiDispatcher, GraphConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;
use uuid::Uuid;

use crate::conversation::Platform;
use crate::error::DispatchError;

/// Platform text limit, in characters.
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// Sends generated replies to prospects.
#[async_trait]
pub trait ReplyDispatcher: Send + Sync {
    /// Deliver `text` to `recipient_id`. Long texts go out as several messages, in order.
    async fn send(
        &self,
        platform: Platform,
        recipient_id: &str,
        text: &str,
        access_token: Option<&SecretString>,
    ) -> Result<(), DispatchError>;
}

/// A reply that was persisted but never reached the prospect.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchFailure {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub agent_config_id: Uuid,
    pub platform: Platform,
    pub recipient_id: String,
    pub reply_text: String,
    pub error: String,
    pub created_at: DateTime<Utc>,
}

/// Split `text` into chunks of at most `max_chars` characters, preferring
/// newline then space boundaries.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        // Byte offset of the first character past the limit, if any.
        let Some((limit, _)) = remaining.char_indices().nth(max_chars) else {
            chunks.push(remaining.to_string());
            break;
        };

        let window = &remaining[..limit];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].trim_end().to_string());
        remaining = remaining[split_at..].trim_start();
    }

    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}
