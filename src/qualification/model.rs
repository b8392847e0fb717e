//! Lead types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Next action recorded for a freshly qualified lead.
pub const DEFAULT_NEXT_ACTION: &str = "contact";

/// Next action once a meeting is booked.
pub const BOOKED_NEXT_ACTION: &str = "booked";

/// Contact and context details pulled out of a conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadFields {
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub phone: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub budget: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub motivation: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub timeline: Option<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub pain_points: Vec<String>,
}

/// What the generation backend reports when asked to score a conversation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreReport {
    /// Raw score as the backend wrote it. The engine checks it is a whole
    /// number in `0..=10`.
    pub score: f64,
    #[serde(default)]
    pub is_qualified: Option<bool>,
    #[serde(default)]
    pub extracted_info: LeadFields,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub next_steps: Option<String>,
}

/// Outcome of evaluating a [`ScoreReport`] against an agent's criteria.
#[derive(Debug, Clone, PartialEq)]
pub struct QualificationResult {
    pub is_qualified: bool,
    pub score: u8,
    pub min_score: u8,
    pub contact_info: LeadFields,
    pub reasoning: String,
    pub next_action: String,
}

impl QualificationResult {
    /// Fields to upsert, only when the lead cleared the threshold.
    pub fn lead_fields(&self) -> Option<LeadUpsert> {
        self.is_qualified.then(|| LeadUpsert {
            contact_info: self.contact_info.clone(),
            qualification_score: self.score,
            qualification_reason: self.reasoning.clone(),
            next_action: self.next_action.clone(),
        })
    }
}

/// Values written by `UpsertLead`.
#[derive(Debug, Clone, PartialEq)]
pub struct LeadUpsert {
    pub contact_info: LeadFields,
    pub qualification_score: u8,
    pub qualification_reason: String,
    pub next_action: String,
}

/// A qualified lead. One per conversation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedLead {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub contact_info: LeadFields,
    pub qualification_score: u8,
    pub qualification_reason: String,
    pub next_action: String,
    pub booked_at: Option<DateTime<Utc>>,
    pub meeting_link: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-agent funnel numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    pub total_conversations: u64,
    pub active_conversations: u64,
    pub qualified_leads: u64,
    pub booked_meetings: u64,
    /// Qualified leads per conversation, as a percentage.
    pub conversion_rate: f64,
}

impl AgentStats {
    pub fn new(total: u64, active: u64, qualified: u64, booked: u64) -> Self {
        let conversion_rate = if total == 0 {
            0.0
        } else {
            qualified as f64 / total as f64 * 100.0
        };
        Self {
            total_conversations: total,
            active_conversations: active,
            qualified_leads: qualified,
            booked_meetings: booked,
            conversion_rate,
        }
    }
}

// Models fill unknown fields with "...", numbers, or null. Keep what is usable.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => {
            let trimmed = s.trim();
            (!trimmed.is_empty() && trimmed != "...").then(|| trimmed.to_string())
        }
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) if !s.trim().is_empty() && s != "..." => Some(s),
                _ => None,
            })
            .collect(),
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => vec![s],
        _ => Vec::new(),
    })
}
