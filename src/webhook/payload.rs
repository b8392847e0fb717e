//! Meta webhook payloads and their normalization into [`InboundMessage`]s.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::conversation::Platform;

/// Top-level webhook body: `{object, entry: [...]}`.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub object: String,
    #[serde(default)]
    pub entry: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
pub struct Entry {
    /// Page or Instagram account that received the events.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub messaging: Vec<MessagingEvent>,
    #[serde(default)]
    pub changes: Vec<Change>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Party {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct MessagingEvent {
    #[serde(default)]
    pub sender: Option<Party>,
    #[serde(default)]
    pub recipient: Option<Party>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub message: Option<MessageBody>,
    #[serde(default)]
    pub postback: Option<Postback>,
}

#[derive(Debug, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub is_echo: bool,
    #[serde(default)]
    pub attachments: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct Postback {
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub payload: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Change {
    pub field: String,
    #[serde(default)]
    pub value: Value,
}

/// The `value` of an Instagram `messages` change.
#[derive(Debug, Deserialize)]
struct ChangeMessage {
    #[serde(default, alias = "sender")]
    from: Option<Party>,
    #[serde(default)]
    to: Option<Party>,
    #[serde(default)]
    recipient: Option<Party>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    message: Option<MessageBody>,
}

/// A platform-neutral inbound message, ready to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub platform: Platform,
    /// Page/account the message was addressed to.
    pub account_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub text: String,
    pub attachments: Vec<Value>,
    pub timestamp: DateTime<Utc>,
    pub is_postback: bool,
    pub postback_payload: Option<String>,
    pub message_id: Option<String>,
}

impl WebhookPayload {
    pub fn platform(&self) -> Option<Platform> {
        match self.object.as_str() {
            "page" => Some(Platform::Messenger),
            "instagram" => Some(Platform::Instagram),
            _ => None,
        }
    }

    /// Every message in the payload that needs an answer.
    ///
    /// Echoes of our own sends, receipts and text-less events are dropped.
    pub fn into_messages(self) -> Vec<InboundMessage> {
        let Some(platform) = self.platform() else {
            debug!(object = %self.object, "Ignoring webhook for unsupported object");
            return Vec::new();
        };

        let mut out = Vec::new();
        for entry in self.entry {
            for event in entry.messaging {
                if let Some(msg) = normalize_messaging(platform, entry.id.as_deref(), event) {
                    out.push(msg);
                }
            }
            for change in entry.changes {
                if change.field != "messages" {
                    continue;
                }
                if let Some(msg) = normalize_change(platform, entry.id.as_deref(), change.value) {
                    out.push(msg);
                }
            }
        }
        out
    }
}

fn normalize_messaging(
    platform: Platform,
    entry_id: Option<&str>,
    event: MessagingEvent,
) -> Option<InboundMessage> {
    let sender_id = event.sender?.id;
    let recipient_id = event.recipient.map(|p| p.id).unwrap_or_default();
    let account_id = entry_id.map(str::to_string).unwrap_or_else(|| recipient_id.clone());
    let sent_at = parse_timestamp(event.timestamp.as_ref());
    let timestamp = sent_at.unwrap_or_else(Utc::now);

    if let Some(message) = event.message {
        if message.is_echo {
            return None;
        }
        let text = non_empty(message.text)?;
        return Some(InboundMessage {
            platform,
            account_id,
            sender_id,
            recipient_id,
            text,
            attachments: message.attachments,
            timestamp,
            is_postback: false,
            postback_payload: None,
            message_id: message.mid,
        });
    }

    if let Some(postback) = event.postback {
        let text = non_empty(postback.title).or_else(|| non_empty(postback.payload.clone()))?;
        // Without a mid or an event time there is nothing stable to de-duplicate on.
        let message_id = postback
            .mid
            .or_else(|| sent_at.map(|at| format!("postback_{}", at.timestamp_millis())));
        return Some(InboundMessage {
            platform,
            account_id,
            sender_id,
            recipient_id,
            text,
            attachments: Vec::new(),
            timestamp,
            is_postback: true,
            postback_payload: postback.payload,
            message_id,
        });
    }

    // Read and delivery receipts.
    None
}

fn normalize_change(platform: Platform, entry_id: Option<&str>, value: Value) -> Option<InboundMessage> {
    let change: ChangeMessage = match serde_json::from_value(value) {
        Ok(change) => change,
        Err(e) => {
            debug!(error = %e, "Ignoring unreadable messages change");
            return None;
        }
    };
    let message = change.message?;
    if message.is_echo {
        return None;
    }
    let sender_id = change.from?.id;
    let recipient_id = change
        .to
        .or(change.recipient)
        .map(|p| p.id)
        .unwrap_or_default();
    let text = non_empty(message.text)?;

    Some(InboundMessage {
        platform,
        account_id: entry_id.map(str::to_string).unwrap_or_else(|| recipient_id.clone()),
        sender_id,
        recipient_id,
        text,
        attachments: message.attachments,
        timestamp: parse_timestamp(change.timestamp.as_ref()).unwrap_or_else(Utc::now),
        is_postback: false,
        postback_payload: None,
        message_id: message.mid,
    })
}

fn non_empty(text: Option<String>) -> Option<String> {
    text.filter(|t| !t.trim().is_empty())
}

/// Meta sends epoch milliseconds, sometimes seconds, sometimes as a string.
fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let raw = match value {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse::<i64>().ok(),
        _ => None,
    };
    raw.and_then(|ts| {
        // Anything below ~2001 in milliseconds is a seconds value.
        if ts < 1_000_000_000_000 {
            Utc.timestamp_opt(ts, 0).single()
        } else {
            Utc.timestamp_millis_opt(ts).single()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(body: Value) -> Vec<InboundMessage> {
        serde_json::from_value::<WebhookPayload>(body)
            .unwrap()
            .into_messages()
    }

    #[test]
    fn messenger_text_message() {
        let messages = parse(json!({
            "object": "page",
            "entry": [{
                "id": "page-1",
                "time": 1736071200000u64,
                "messaging": [{
                    "sender": {"id": "psid-1"},
                    "recipient": {"id": "page-1"},
                    "timestamp": 1736071200000u64,
                    "message": {"mid": "mid.1", "text": "Hello"}
                }]
            }]
        }));
        assert_eq!(messages.len(), 1);
        let msg = &messages[0];
        assert_eq!(msg.platform, Platform::Messenger);
        assert_eq!(msg.account_id, "page-1");
        assert_eq!(msg.sender_id, "psid-1");
        assert_eq!(msg.text, "Hello");
        assert_eq!(msg.message_id.as_deref(), Some("mid.1"));
        assert_eq!(msg.timestamp.timestamp_millis(), 1736071200000);
        assert!(!msg.is_postback);
    }

    #[test]
    fn echoes_and_receipts_are_dropped() {
        let messages = parse(json!({
            "object": "page",
            "entry": [{
                "id": "page-1",
                "messaging": [
                    {"sender": {"id": "page-1"}, "recipient": {"id": "psid-1"},
                     "message": {"mid": "mid.2", "text": "our reply", "is_echo": true}},
                    {"sender": {"id": "psid-1"}, "recipient": {"id": "page-1"},
                     "delivery": {"mids": ["mid.2"], "watermark": 1}},
                    {"sender": {"id": "psid-1"}, "recipient": {"id": "page-1"},
                     "read": {"watermark": 1}},
                    {"sender": {"id": "psid-1"}, "recipient": {"id": "page-1"},
                     "message": {"mid": "mid.3", "attachments": [{"type": "image"}]}}
                ]
            }]
        }));
        assert!(messages.is_empty());
    }

    #[test]
    fn postback_uses_button_title() {
        let messages = parse(json!({
            "object": "page",
            "entry": [{
                "id": "page-1",
                "messaging": [{
                    "sender": {"id": "psid-1"},
                    "recipient": {"id": "page-1"},
                    "timestamp": 1736071200000u64,
                    "postback": {"title": "Book a call", "payload": "BOOK_CALL"}
                }]
            }]
        }));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "Book a call");
        assert!(messages[0].is_postback);
        assert_eq!(messages[0].postback_payload.as_deref(), Some("BOOK_CALL"));
        assert_eq!(messages[0].message_id.as_deref(), Some("postback_1736071200000"));
    }

    #[test]
    fn postback_without_mid_or_time_has_no_message_id() {
        let body = json!({
            "object": "page",
            "entry": [{
                "id": "page-1",
                "messaging": [{
                    "sender": {"id": "psid-1"},
                    "recipient": {"id": "page-1"},
                    "postback": {"title": "Book a call", "payload": "BOOK_CALL"}
                }]
            }]
        });
        let first = parse(body.clone());
        let again = parse(body);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message_id, None);
        assert_eq!(again[0].message_id, None);
    }

    #[test]
    fn instagram_messages_change() {
        let messages = parse(json!({
            "object": "instagram",
            "entry": [{
                "id": "ig-account",
                "changes": [
                    {"field": "comments", "value": {"text": "nice"}},
                    {"field": "messages", "value": {
                        "from": {"id": "igsid-9"},
                        "to": {"id": "ig-account"},
                        "timestamp": "1736071200",
                        "message": {"mid": "ig.mid.1", "text": "Price?"}
                    }}
                ]
            }]
        }));
        assert_eq!(messages.len(), 1);
        let msg = &messages[0];
        assert_eq!(msg.platform, Platform::Instagram);
        assert_eq!(msg.sender_id, "igsid-9");
        assert_eq!(msg.recipient_id, "ig-account");
        assert_eq!(msg.timestamp.timestamp(), 1736071200);
    }

    #[test]
    fn unknown_object_yields_nothing() {
        let messages = parse(json!({"object": "whatsapp_business_account", "entry": [{"id": "x"}]}));
        assert!(messages.is_empty());
    }
}
