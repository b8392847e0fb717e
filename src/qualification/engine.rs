//! Threshold logic for lead qualification. No I/O.

use crate::agent_config::QualificationCriteria;
use crate::error::LlmError;
use crate::qualification::model::{DEFAULT_NEXT_ACTION, QualificationResult, ScoreReport};

/// Evaluate a scoring report against the agent's criteria.
///
/// A score that is not a whole number in `0..=10` is treated as a malformed
/// backend response, never clamped or rounded.
pub fn evaluate(
    report: ScoreReport,
    criteria: &QualificationCriteria,
    provider: &str,
) -> Result<QualificationResult, LlmError> {
    let score = whole_score(report.score).ok_or_else(|| LlmError::Malformed {
        provider: provider.to_string(),
        reason: format!("qualification score {} is not an integer in 0..=10", report.score),
    })?;

    let min_score = criteria.min_score();
    let next_action = report
        .next_steps
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_NEXT_ACTION.to_string());

    Ok(QualificationResult {
        is_qualified: score >= min_score,
        score,
        min_score,
        contact_info: report.extracted_info,
        reasoning: report.reasoning,
        next_action,
    })
}

fn whole_score(raw: f64) -> Option<u8> {
    (raw.is_finite() && raw.fract() == 0.0 && (0.0..=10.0).contains(&raw)).then(|| raw as u8)
}

/// Whether qualification should run after a reply, given the USER-turn count
/// the log now holds.
///
/// Fires first at `threshold`, then again every `every` further USER turns.
/// `every == 0` disables re-qualification.
pub fn should_qualify(user_turns: usize, threshold: usize, every: usize) -> bool {
    if user_turns < threshold {
        return false;
    }
    let since = user_turns - threshold;
    since == 0 || (every > 0 && since % every == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qualification::model::LeadFields;

    fn report(score: f64) -> ScoreReport {
        ScoreReport {
            score,
            is_qualified: None,
            extracted_info: LeadFields::default(),
            reasoning: "because".into(),
            next_steps: None,
        }
    }

    fn criteria(min: u8) -> QualificationCriteria {
        QualificationCriteria {
            description: "has budget".into(),
            min_score: Some(min),
        }
    }

    #[test]
    fn qualifies_at_threshold() {
        let result = evaluate(report(7.0), &criteria(7), "stub").unwrap();
        assert!(result.is_qualified);
        assert_eq!(result.next_action, "contact");
        assert!(result.lead_fields().is_some());

        let below = evaluate(report(6.0), &criteria(7), "stub").unwrap();
        assert!(!below.is_qualified);
        assert!(below.lead_fields().is_none());
    }

    #[test]
    fn ignores_backend_opinion_on_qualification() {
        let mut r = report(9.0);
        r.is_qualified = Some(false);
        assert!(evaluate(r, &criteria(7), "stub").unwrap().is_qualified);
    }

    #[test]
    fn out_of_range_scores_are_malformed() {
        for score in [-1.0, 10.5, 11.0, f64::NAN, f64::INFINITY] {
            let err = evaluate(report(score), &criteria(7), "stub").unwrap_err();
            assert!(matches!(err, LlmError::Malformed { .. }), "score {score}");
        }
        assert_eq!(evaluate(report(0.0), &criteria(0), "stub").unwrap().score, 0);
        assert_eq!(evaluate(report(10.0), &criteria(10), "stub").unwrap().score, 10);
    }

    #[test]
    fn fractional_scores_are_malformed() {
        for score in [7.5, 6.999, 0.1] {
            let err = evaluate(report(score), &criteria(7), "stub").unwrap_err();
            assert!(matches!(err, LlmError::Malformed { .. }), "score {score}");
        }
    }

    #[test]
    fn uses_default_min_score_when_unset() {
        let result = evaluate(report(6.0), &QualificationCriteria::default(), "stub").unwrap();
        assert_eq!(result.min_score, 7);
        assert!(!result.is_qualified);
    }

    #[test]
    fn next_steps_override_default_action() {
        let mut r = report(8.0);
        r.next_steps = Some("propose a call".into());
        let result = evaluate(r, &criteria(7), "stub").unwrap();
        assert_eq!(result.next_action, "propose a call");
    }

    #[test]
    fn qualification_cadence() {
        assert!(!should_qualify(2, 3, 1));
        assert!(should_qualify(3, 3, 1));
        assert!(should_qualify(4, 3, 1));

        assert!(should_qualify(3, 3, 2));
        assert!(!should_qualify(4, 3, 2));
        assert!(should_qualify(5, 3, 2));

        assert!(should_qualify(3, 3, 0));
        assert!(!should_qualify(4, 3, 0));
    }
}
