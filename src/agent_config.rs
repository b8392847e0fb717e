//! Qualification-agent profiles.
//!
//! Profiles are owned by an external configuration service; the pipeline only
//! reads them (the store's upsert exists for seeding and tests).

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Score a lead must reach when the agent does not set its own threshold.
pub const DEFAULT_MIN_SCORE: u8 = 7;

/// What makes a prospect qualified for a given agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualificationCriteria {
    /// Free-form description handed to the scoring prompt.
    #[serde(default)]
    pub description: String,
    /// Threshold on the 0–10 scale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<u8>,
}

impl QualificationCriteria {
    pub fn min_score(&self) -> u8 {
        self.min_score.unwrap_or(DEFAULT_MIN_SCORE).min(10)
    }
}

/// A qualification-agent profile.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub id: Uuid,
    pub name: String,
    pub system_prompt: String,
    pub qualification_criteria: QualificationCriteria,
    pub is_active: bool,
    /// Page/account access token used to send replies.
    pub access_token: Option<SecretString>,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            system_prompt: system_prompt.into(),
            qualification_criteria: QualificationCriteria::default(),
            is_active: true,
            access_token: None,
        }
    }

    pub fn with_criteria(mut self, description: impl Into<String>, min_score: u8) -> Self {
        self.qualification_criteria = QualificationCriteria {
            description: description.into(),
            min_score: Some(min_score),
        };
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(SecretString::from(token.into()));
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_score_defaults_to_seven() {
        let criteria: QualificationCriteria =
            serde_json::from_str(r#"{"description":"budget over 1k"}"#).unwrap();
        assert_eq!(criteria.min_score(), 7);

        let strict: QualificationCriteria =
            serde_json::from_str(r#"{"description":"","minScore":9}"#).unwrap();
        assert_eq!(strict.min_score(), 9);
    }

    #[test]
    fn min_score_is_capped_to_scale() {
        let criteria = QualificationCriteria {
            description: String::new(),
            min_score: Some(42),
        };
        assert_eq!(criteria.min_score(), 10);
    }
}
