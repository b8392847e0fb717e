//! Conversation domain types: platforms, status machine, and the append-only turn log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Platform ────────────────────────────────────────────────────────────

/// Messaging platform a conversation lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Platform {
    Messenger,
    Instagram,
    /// Conversations driven through the test endpoint; replies are never sent out.
    Test,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Messenger => "MESSENGER",
            Self::Instagram => "INSTAGRAM",
            Self::Test => "TEST",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MESSENGER" => Ok(Self::Messenger),
            "INSTAGRAM" => Ok(Self::Instagram),
            "TEST" => Ok(Self::Test),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

// ── Status ──────────────────────────────────────────────────────────────

/// Lifecycle of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    /// Created, no reply delivered yet.
    Pending,
    /// At least one reply has been generated and persisted.
    Active,
    /// Closed externally. Never reopened.
    Closed,
}

impl ConversationStatus {
    pub fn can_transition_to(&self, target: ConversationStatus) -> bool {
        use ConversationStatus::*;

        matches!(
            (self, target),
            (Pending, Active) | (Pending, Closed) | (Active, Closed)
        )
    }

    /// Open conversations count towards the one-per-triple invariant.
    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown conversation status: {other}")),
        }
    }
}

// ── Turns ───────────────────────────────────────────────────────────────

/// Who authored a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Platform message id of the inbound message this turn records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Ordered, append-only sequence of turns.
///
/// There is no way to remove or reorder turns. New turns are staged through
/// [`TurnLog::begin_append`] and only become part of the log once the store
/// has accepted them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnLog {
    turns: Vec<Turn>,
}

impl TurnLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted turns. Turns must already be in log order.
    pub fn from_persisted(turns: Vec<Turn>) -> Self {
        Self { turns }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn user_turn_count(&self) -> usize {
        self.turns.iter().filter(|t| t.role == Role::User).count()
    }

    /// Whether a USER turn for this platform message id is already recorded.
    pub fn contains_message(&self, message_id: &str) -> bool {
        self.turns
            .iter()
            .any(|t| t.role == Role::User && t.message_id.as_deref() == Some(message_id))
    }

    /// Start staging new turns on top of the current log.
    pub fn begin_append(&self) -> TurnAppend<'_> {
        TurnAppend {
            base: self,
            staged: Vec::new(),
        }
    }
}

/// Turns staged against a snapshot of a [`TurnLog`].
///
/// `base_len()` is the log length the store must still see when the staged
/// turns are written (compare-and-append).
pub struct TurnAppend<'a> {
    base: &'a TurnLog,
    staged: Vec<Turn>,
}

impl TurnAppend<'_> {
    /// Stage a turn stamped with the current time.
    pub fn push(&mut self, role: Role, content: impl Into<String>, message_id: Option<String>) {
        self.push_at(role, content, message_id, Utc::now());
    }

    /// Stage a turn, bumping `at` forward if needed so timestamps stay strictly increasing.
    pub fn push_at(
        &mut self,
        role: Role,
        content: impl Into<String>,
        message_id: Option<String>,
        at: DateTime<Utc>,
    ) {
        let floor = self
            .staged
            .last()
            .or_else(|| self.base.last())
            .map(|t| t.timestamp + Duration::milliseconds(1));
        let timestamp = match floor {
            Some(floor) if at < floor => floor,
            _ => at,
        };
        self.staged.push(Turn {
            role,
            content: content.into(),
            timestamp,
            message_id,
        });
    }

    pub fn base_len(&self) -> usize {
        self.base.len()
    }

    /// Turns already in the log before this append.
    pub fn prior_turns(&self) -> &[Turn] {
        self.base.turns()
    }

    pub fn staged(&self) -> &[Turn] {
        &self.staged
    }

    /// Number of USER turns the log will hold once the staged turns land.
    pub fn user_turn_count(&self) -> usize {
        self.base.user_turn_count() + self.staged.iter().filter(|t| t.role == Role::User).count()
    }

    pub fn into_staged(self) -> Vec<Turn> {
        self.staged
    }
}

// ── Conversation ────────────────────────────────────────────────────────

/// Identity of an open conversation: one per (agent, platform, prospect).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationKey {
    pub agent_config_id: Uuid,
    pub platform: Platform,
    pub external_user_id: String,
}

impl ConversationKey {
    pub fn new(agent_config_id: Uuid, platform: Platform, external_user_id: impl Into<String>) -> Self {
        Self {
            agent_config_id,
            platform,
            external_user_id: external_user_id.into(),
        }
    }

    /// Queue partition shared by every job that touches this conversation.
    pub fn partition_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.agent_config_id, self.platform, self.external_user_id
        )
    }
}

/// A conversation between an agent and a prospect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub agent_config_id: Uuid,
    pub platform: Platform,
    pub external_user_id: String,
    pub status: ConversationStatus,
    pub messages: TurnLog,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(self.agent_config_id, self.platform, &self.external_user_id)
    }
}
