//! Feedback validator: turns user verdicts into rule counters and hypothesis
//! resolutions.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::policy::types::{Decision, Feedback, HypothesisStatus, Resolution};
use crate::store::PolicyStore;

/// Why a feedback event changed nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    UnknownDecision,
    UnknownRule,
    UnknownHypothesis,
    AlreadyResolved,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UnknownDecision => "unknown decision",
            Self::UnknownRule => "unknown rule",
            Self::UnknownHypothesis => "unknown hypothesis",
            Self::AlreadyResolved => "hypothesis already resolved",
        };
        f.write_str(s)
    }
}

/// What a feedback event did.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    /// Counters of the applied rule were incremented.
    RuleOutcomeRecorded { rule_id: Uuid, correct: bool },
    /// Exploit decision without an applied rule: nothing to update.
    NoRuleApplied,
    /// The exploration's hypothesis moved out of pending.
    HypothesisResolved {
        hypothesis_id: Uuid,
        status: HypothesisStatus,
    },
    /// Invalid feedback; logged and dropped.
    Ignored(IgnoreReason),
}

/// Whether feedback counts as support for the explored alternative.
///
/// A correction that lands on the pre-exploration action also counts as
/// success, whatever the explored action was.
pub fn exploration_succeeded(decision: &Decision, feedback: &Feedback) -> bool {
    feedback.correct || feedback.corrected_action == Some(decision.base_action)
}

#[derive(Clone)]
pub struct FeedbackValidator {
    store: PolicyStore,
}

impl FeedbackValidator {
    pub fn new(store: PolicyStore) -> Self {
        Self { store }
    }

    /// Apply one feedback record. Invalid feedback is a logged no-op; only
    /// store failures are errors.
    pub async fn validate(
        &self,
        feedback: &Feedback,
        now: DateTime<Utc>,
    ) -> Result<ValidationOutcome, StoreError> {
        let Some(decision) = self.store.get_decision(feedback.decision_id).await? else {
            return Ok(self.ignore(feedback, IgnoreReason::UnknownDecision));
        };

        if decision.is_exploration {
            return self.resolve_hypothesis(&decision, feedback, now).await;
        }

        let Some(rule_id) = decision.applied_rule_id else {
            return Ok(ValidationOutcome::NoRuleApplied);
        };
        match self.store.record_rule_outcome(rule_id, feedback.correct).await {
            Ok(()) => Ok(ValidationOutcome::RuleOutcomeRecorded {
                rule_id,
                correct: feedback.correct,
            }),
            Err(StoreError::NotFound { .. }) => Ok(self.ignore(feedback, IgnoreReason::UnknownRule)),
            Err(e) => Err(e),
        }
    }

    async fn resolve_hypothesis(
        &self,
        decision: &Decision,
        feedback: &Feedback,
        now: DateTime<Utc>,
    ) -> Result<ValidationOutcome, StoreError> {
        let hypothesis = match decision.hypothesis_id {
            Some(id) => self.store.get_hypothesis(id).await?,
            None => None,
        };
        let Some(hypothesis) = hypothesis else {
            return Ok(self.ignore(feedback, IgnoreReason::UnknownHypothesis));
        };

        let validated = exploration_succeeded(decision, feedback);
        let evidence = Resolution {
            feedback_id: feedback.id,
            correct: feedback.correct,
            corrected_action: feedback.corrected_action,
        };
        let Some(resolved) = hypothesis.resolved(validated, evidence, now) else {
            return Ok(self.ignore(feedback, IgnoreReason::AlreadyResolved));
        };

        self.store.save_hypothesis(&resolved).await?;
        info!(
            hypothesis_id = %resolved.id,
            status = resolved.status.as_str(),
            cluster = resolved.cluster_key(),
            "Hypothesis resolved"
        );
        Ok(ValidationOutcome::HypothesisResolved {
            hypothesis_id: resolved.id,
            status: resolved.status,
        })
    }

    fn ignore(&self, feedback: &Feedback, reason: IgnoreReason) -> ValidationOutcome {
        warn!(
            feedback_id = %feedback.id,
            decision_id = %feedback.decision_id,
            reason = %reason,
            "Ignoring feedback"
        );
        ValidationOutcome::Ignored(reason)
    }
}
