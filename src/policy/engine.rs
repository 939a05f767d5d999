//! Decision engine: the entry point callers use to get a decision for a
//! message and to report feedback on it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::PolicyConfig;
use crate::error::PolicyError;
use crate::policy::evaluator::{self, DecisionEvaluator};
use crate::policy::exploration::{ExplorationController, RandomSource};
use crate::policy::types::{Decision, DecisionContext, Feedback, Prediction, WeightVector};
use crate::policy::validator::{FeedbackValidator, ValidationOutcome};
use crate::proposer::StrategyProposer;
use crate::store::PolicyStore;

/// Evaluator, exploration controller and validator wired to one store.
pub struct DecisionEngine {
    store: PolicyStore,
    evaluator: DecisionEvaluator,
    exploration: ExplorationController,
    validator: FeedbackValidator,
}

impl DecisionEngine {
    pub fn new(
        store: PolicyStore,
        proposer: Arc<dyn StrategyProposer>,
        rng: Arc<dyn RandomSource>,
        config: &PolicyConfig,
    ) -> Self {
        Self {
            evaluator: DecisionEvaluator::new(store.clone()),
            exploration: ExplorationController::new(
                store.clone(),
                proposer,
                rng,
                config.exploration.clone(),
            ),
            validator: FeedbackValidator::new(store.clone()),
            store,
        }
    }

    /// Decide what to do with one message and record the decision.
    ///
    /// Store failures while reading degrade to the base prediction or the
    /// exploit decision. A failure to write the record returns the decision
    /// inside `PolicyError::UnpersistedDecision` so the caller can still act.
    pub async fn decide(
        &self,
        context: DecisionContext,
        base: Prediction,
        now: DateTime<Utc>,
    ) -> Result<Decision, PolicyError> {
        let eval = match self.evaluator.evaluate(&context, base).await {
            Ok(eval) => eval,
            Err(e) => {
                warn!(error = %e, "Could not load rules, using base prediction");
                evaluator::evaluate(&[], &context, base)
            }
        };

        let explored = self.exploration.decide(&context, &eval, now).await;
        let decision = match explored {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, "Exploration check failed, exploiting");
                Decision::from_evaluation(context, eval, now)
            }
        };

        if let Err(source) = self.store.insert_decision(&decision).await {
            return Err(PolicyError::UnpersistedDecision {
                decision: Box::new(decision),
                source,
            });
        }

        debug!(
            decision_id = %decision.id,
            action = %decision.action,
            exploration = decision.is_exploration,
            "Decision recorded"
        );
        Ok(decision)
    }

    /// Store a feedback record and apply it to rules or hypotheses.
    pub async fn record_feedback(
        &self,
        feedback: &Feedback,
        now: DateTime<Utc>,
    ) -> Result<ValidationOutcome, PolicyError> {
        self.store.insert_feedback(feedback).await?;
        Ok(self.validator.validate(feedback, now).await?)
    }

    /// Signal weights the base model should currently use.
    pub async fn current_weights(&self) -> Result<WeightVector, PolicyError> {
        Ok(self.store.get_weights(None).await?)
    }

    pub fn store(&self) -> &PolicyStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::error::{ProposerError, StoreError};
    use crate::policy::exploration::ScriptedRandom;
    use crate::policy::rule::{Clause, Predicate, Rule};
    use crate::policy::types::{Action, HypothesisStatus};
    use crate::proposer::{Alternative, AlternativeRequest, Pattern, PatternRequest};
    use crate::store::traits::{DecisionStore, Filter, collections};
    use crate::store::InMemoryStore;

    struct ReplyProposer;

    #[async_trait]
    impl StrategyProposer for ReplyProposer {
        async fn propose_alternative(
            &self,
            _request: &AlternativeRequest,
        ) -> Result<Alternative, ProposerError> {
            Ok(Alternative {
                alternative_action: Action::Reply,
                hypothesis: "this sender expects a reply".into(),
                expected_outcome: "user agrees".into(),
                success_criteria: None,
                confidence: 0.7,
            })
        }

        async fn synthesize_pattern(
            &self,
            _request: &PatternRequest,
        ) -> Result<Pattern, ProposerError> {
            Err(ProposerError::Timeout {
                timeout: std::time::Duration::from_secs(1),
            })
        }
    }

    /// Accepts reads, refuses decision writes.
    struct ReadOnlyDecisions(InMemoryStore);

    #[async_trait]
    impl DecisionStore for ReadOnlyDecisions {
        async fn upsert(&self, collection: &str, id: &str, record: &Value) -> Result<(), StoreError> {
            if collection == collections::DECISIONS {
                return Err(StoreError::Query("disk full".into()));
            }
            self.0.upsert(collection, id, record).await
        }

        async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
            self.0.get(collection, id).await
        }

        async fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Value>, StoreError> {
            self.0.query(collection, filters).await
        }

        async fn atomic_increment(
            &self,
            collection: &str,
            id: &str,
            field: &str,
            delta: i64,
        ) -> Result<i64, StoreError> {
            self.0.atomic_increment(collection, id, field, delta).await
        }

        async fn set_fields_if(
            &self,
            collection: &str,
            id: &str,
            fields: &[(&str, Value)],
            guard: &[Filter],
        ) -> Result<bool, StoreError> {
            self.0.set_fields_if(collection, id, fields, guard).await
        }
    }

    fn engine(store: PolicyStore, draws: Vec<f64>) -> DecisionEngine {
        DecisionEngine::new(
            store,
            Arc::new(ReplyProposer),
            Arc::new(ScriptedRandom::new(draws)),
            &PolicyConfig::default(),
        )
    }

    #[tokio::test]
    async fn rule_decision_is_recorded_and_counted() {
        let store = PolicyStore::new(Arc::new(InMemoryStore::new()));
        let rule = Rule::new(
            Predicate::new([Clause::equals("sender_domain", "acme.com")]),
            Action::Archive,
            0.9,
            vec![],
            "Archive acme.com",
            Utc::now(),
        );
        store.upsert_rule(&rule).await.unwrap();

        // Draw 0.99 never explores.
        let engine = engine(store.clone(), vec![0.99]);
        let ctx = DecisionContext::new()
            .with("sender_domain", "acme.com")
            .with("subject", "hi");
        let decision = engine
            .decide(ctx, Prediction::new(Action::Star, 0.7), Utc::now())
            .await
            .unwrap();
        assert_eq!(decision.action, Action::Archive);
        assert_eq!(decision.applied_rule_id, Some(rule.id));
        assert!(!decision.is_exploration);
        assert!(store.get_decision(decision.id).await.unwrap().is_some());

        let outcome = engine
            .record_feedback(&Feedback::correct(decision.id), Utc::now())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ValidationOutcome::RuleOutcomeRecorded {
                rule_id: rule.id,
                correct: true
            }
        );
        let stored = store.get_rule(rule.id).await.unwrap().unwrap();
        assert_eq!((stored.usage_count, stored.correct_count), (1, 1));
    }

    #[tokio::test]
    async fn low_confidence_exploration_round_trip() {
        let store = PolicyStore::new(Arc::new(InMemoryStore::new()));
        let engine = engine(store.clone(), vec![0.35]);
        let ctx = DecisionContext::new().with("relationship_type", "friend");

        let decision = engine
            .decide(ctx, Prediction::new(Action::Archive, 0.5), Utc::now())
            .await
            .unwrap();
        assert!(decision.is_exploration);
        assert_eq!(decision.action, Action::Reply);
        assert_eq!(decision.base_action, Action::Archive);
        assert_eq!(decision.confidence, 0.5);

        engine
            .record_feedback(
                &Feedback::corrected(decision.id, Action::Archive),
                Utc::now(),
            )
            .await
            .unwrap();
        let hypothesis = store
            .get_hypothesis(decision.hypothesis_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hypothesis.status, HypothesisStatus::Validated);
    }

    #[tokio::test]
    async fn failed_write_still_returns_decision() {
        let store = PolicyStore::new(Arc::new(ReadOnlyDecisions(InMemoryStore::new())));
        let engine = engine(store, vec![0.99]);

        let err = engine
            .decide(
                DecisionContext::new(),
                Prediction::new(Action::Star, 0.8),
                Utc::now(),
            )
            .await
            .unwrap_err();
        match err {
            PolicyError::UnpersistedDecision { decision, source } => {
                assert_eq!(decision.action, Action::Star);
                assert!(matches!(source, StoreError::Query(_)));
            }
            other => panic!("expected unpersisted decision, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn feedback_for_unknown_decision_is_ignored() {
        let store = PolicyStore::new(Arc::new(InMemoryStore::new()));
        let engine = engine(store, vec![0.99]);
        let outcome = engine
            .record_feedback(&Feedback::correct(uuid::Uuid::new_v4()), Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, ValidationOutcome::Ignored(_)));
    }
}
