//! Job payloads and queue records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::ConversationKey;

// ── Payloads ────────────────────────────────────────────────────────────

/// A typed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "kebab-case")]
pub enum Job {
    ProcessMessage(ProcessMessageJob),
    QualifyLead(QualifyLeadJob),
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProcessMessage(_) => "process-message",
            Self::QualifyLead(_) => "qualify-lead",
        }
    }
}

/// Which conversation a `process-message` job targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConversationTarget {
    /// Find or create the open conversation for this triple.
    Key {
        #[serde(rename = "conversationKey")]
        conversation_key: ConversationKey,
    },
    /// An existing conversation.
    Id {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
    },
}

/// The prospect who sent a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// An inbound message to answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMessageJob {
    #[serde(flatten)]
    pub target: ConversationTarget,
    pub text: String,
    pub sender: Sender,
    #[serde(default)]
    pub attachments: Vec<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_postback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postback_payload: Option<String>,
    /// Platform message id, used to drop redeliveries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Page/account the message was addressed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

/// Score a conversation against its agent's criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualifyLeadJob {
    pub conversation_id: Uuid,
}

// ── Status ──────────────────────────────────────────────────────────────

/// State of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `available_at` and for its partition to free up.
    Pending,
    /// Claimed by a worker and holding a lease.
    Processing,
    /// Ran to completion.
    Completed,
    /// Recognised soft skip (inactive agent, duplicate, ...).
    Skipped,
    /// Exhausted its attempts or failed permanently.
    Dead,
    /// Cancelled before it started.
    Cancelled,
}

impl JobStatus {
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Processing) | (Pending, Cancelled) |
            // A retry puts the job back; an expired lease is re-claimed.
            (Processing, Pending) | (Processing, Processing) |
            (Processing, Completed) | (Processing, Skipped) | (Processing, Dead) |
            // Operator requeue.
            (Dead, Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Skipped | Self::Dead | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Dead => "dead",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "skipped" => Ok(Self::Skipped),
            "dead" => Ok(Self::Dead),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Why a job was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AgentNotFound,
    AgentInactive,
    GenerationUnconfigured,
    DuplicateMessage,
    ConversationClosed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AgentNotFound => "agent_not_found",
            Self::AgentInactive => "agent_inactive",
            Self::GenerationUnconfigured => "generation_unconfigured",
            Self::DuplicateMessage => "duplicate_message",
            Self::ConversationClosed => "conversation_closed",
        };
        f.write_str(s)
    }
}

/// How a job finished, as reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Skipped(SkipReason),
}

// ── Records ─────────────────────────────────────────────────────────────

/// A job to insert.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub job: Job,
    pub partition_key: String,
    pub agent_config_id: Option<Uuid>,
    pub max_attempts: u32,
    pub available_at: DateTime<Utc>,
}

/// A job as stored in the queue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: Uuid,
    pub seq: i64,
    pub job: Job,
    pub partition_key: String,
    pub agent_config_id: Option<Uuid>,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub available_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub outcome: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
